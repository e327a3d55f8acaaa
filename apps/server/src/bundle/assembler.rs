//! Transaction bundle assembly (C7): wraps a list of already-built resources
//! into a FHIR transaction `Bundle`, assigning stable `fullUrl`s and
//! rewriting internal references to point at them where possible.

use std::collections::HashMap;

use fhir_pipeline_models::{Bundle, BundleEntry, BundleEntryRequest, Resource};
use serde_json::Value;

/// Stateless — assembly is a pure function of the resource list, so there is
/// nothing to cache or lock here.
#[derive(Default)]
pub struct BundleAssembler;

impl BundleAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Builds the bundle skeleton, assigns `urn:uuid:<uuid>` full URLs to
    /// every entry, and rewrites `Type/id` references to the matching
    /// entry's full URL. References with no matching entry are left as-is
    /// (relative, to be resolved by the receiving FHIR server).
    pub fn assemble(&self, resources: Vec<Resource>, _request_id: Option<&str>) -> Bundle {
        let mut bundle = Bundle::transaction();

        let mut full_urls: HashMap<String, String> = HashMap::new();
        for resource in &resources {
            if let Some(reference) = resource.reference() {
                full_urls.insert(reference, format!("urn:uuid:{}", uuid::Uuid::new_v4()));
            }
        }

        for resource in resources {
            let resource_type = resource.resource_type().to_string();
            let reference = resource.reference();
            let full_url = reference
                .as_ref()
                .and_then(|r| full_urls.get(r))
                .cloned()
                .unwrap_or_else(|| format!("urn:uuid:{}", uuid::Uuid::new_v4()));

            let mut value = resource.into_value();
            rewrite_references(&mut value, &full_urls);
            let resource = Resource::from_value(value).expect("resourceType preserved by rewrite");

            bundle.entry.push(BundleEntry {
                full_url,
                resource,
                request: BundleEntryRequest::post(&resource_type),
            });
        }

        bundle
    }
}

fn rewrite_references(value: &mut Value, full_urls: &HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(r)) = map.get("reference") {
                if let Some(full_url) = full_urls.get(r) {
                    map.insert("reference".to_string(), Value::String(full_url.clone()));
                    return;
                }
            }
            for v in map.values_mut() {
                rewrite_references(v, full_urls);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_references(item, full_urls);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assigns_unique_full_urls_per_entry() {
        let mut patient = Resource::new("Patient");
        patient.set_id("p1");
        let mut condition = Resource::new("Condition");
        condition.set_id("c1");

        let bundle = BundleAssembler::new().assemble(vec![patient, condition], None);
        assert_eq!(bundle.entry.len(), 2);
        assert_ne!(bundle.entry[0].full_url, bundle.entry[1].full_url);
        assert!(bundle.entry[0].full_url.starts_with("urn:uuid:"));
    }

    #[test]
    fn rewrites_internal_reference_to_full_url() {
        let mut patient = Resource::new("Patient");
        patient.set_id("p1");
        let mut condition = Resource::new("Condition");
        condition.set_id("c1");
        condition.set("subject", json!({ "reference": "Patient/p1" }));

        let bundle = BundleAssembler::new().assemble(vec![patient, condition], None);
        let patient_full_url = bundle.entry[0].full_url.clone();
        let subject = bundle.entry[1].resource.get("subject").unwrap();
        assert_eq!(subject.get("reference").and_then(Value::as_str), Some(patient_full_url.as_str()));
    }

    #[test]
    fn leaves_unmatched_reference_relative() {
        let mut condition = Resource::new("Condition");
        condition.set_id("c1");
        condition.set("subject", json!({ "reference": "Patient/does-not-exist" }));

        let bundle = BundleAssembler::new().assemble(vec![condition], None);
        let subject = bundle.entry[0].resource.get("subject").unwrap();
        assert_eq!(subject.get("reference").and_then(Value::as_str), Some("Patient/does-not-exist"));
    }

    #[test]
    fn entry_requests_are_post_to_resource_type() {
        let mut patient = Resource::new("Patient");
        patient.set_id("p1");
        let bundle = BundleAssembler::new().assemble(vec![patient], None);
        assert_eq!(bundle.entry[0].request.method, "POST");
        assert_eq!(bundle.entry[0].request.url, "Patient");
    }
}
