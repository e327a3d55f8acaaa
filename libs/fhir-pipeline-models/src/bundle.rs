use serde::{Deserialize, Serialize};

use crate::Resource;

/// A FHIR `Bundle.entry.request` structure. The pipeline only ever assembles
/// `transaction` bundles, so every entry carries a request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleEntryRequest {
    pub method: String,
    pub url: String,
    #[serde(rename = "ifNoneExist", skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
}

impl BundleEntryRequest {
    pub fn post(resource_type: &str) -> Self {
        Self { method: "POST".to_string(), url: resource_type.to_string(), if_none_exist: None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    #[serde(rename = "fullUrl")]
    pub full_url: String,
    pub resource: Resource,
    pub request: BundleEntryRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    pub id: String,
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn transaction() -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            id: format!("bundle-{}", uuid::Uuid::new_v4()),
            bundle_type: "transaction".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            meta: None,
            entry: Vec::new(),
        }
    }

    pub fn resource_types(&self) -> Vec<&str> {
        self.entry.iter().map(|e| e.resource.resource_type()).collect()
    }

    pub fn find_first_of_type(&self, resource_type: &str) -> Option<&BundleEntry> {
        self.entry.iter().find(|e| e.resource.resource_type() == resource_type)
    }
}
