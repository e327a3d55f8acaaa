use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ModelError;

/// A FHIR resource, represented as its JSON object.
///
/// Factories build these field-by-field; the validator, optimizer, and
/// assembler all walk them generically via [`Resource::as_map`]. Typed
/// accessors exist only for the handful of fields every stage of the
/// pipeline needs (`resourceType`, `id`, `meta`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Map<String, Value>);

impl Resource {
    pub fn new(resource_type: &str) -> Self {
        let mut map = Map::new();
        map.insert("resourceType".to_string(), Value::String(resource_type.to_string()));
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self, ModelError> {
        if !map.contains_key("resourceType") {
            return Err(ModelError::MissingResourceType);
        }
        Ok(Self(map))
    }

    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(ModelError::MissingResourceType),
        }
    }

    pub fn resource_type(&self) -> &str {
        self.0
            .get("resourceType")
            .and_then(Value::as_str)
            .expect("Resource invariant: resourceType always present")
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("id".to_string(), Value::String(id.into()));
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.0.get_mut(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Canonical `Type/id` reference string for this resource, if it has an id.
    pub fn reference(&self) -> Option<String> {
        self.id().map(|id| format!("{}/{}", self.resource_type(), id))
    }

    /// Field count, used by the quality optimizer's completeness scoring and
    /// by the performance manager's PHI-safe structural fingerprint.
    pub fn field_count(&self) -> usize {
        self.0.len()
    }

    pub fn has_identifier(&self) -> bool {
        self.0
            .get("identifier")
            .map(|v| !matches!(v, Value::Array(a) if a.is_empty()))
            .unwrap_or(false)
    }

    pub fn has_reference_to(&self, target_type: &str) -> bool {
        fn walk(value: &Value, target_type: &str) -> bool {
            match value {
                Value::Object(map) => {
                    if let Some(Value::String(r)) = map.get("reference") {
                        if r.starts_with(&format!("{target_type}/")) {
                            return true;
                        }
                    }
                    map.values().any(|v| walk(v, target_type))
                }
                Value::Array(arr) => arr.iter().any(|v| walk(v, target_type)),
                _ => false,
            }
        }
        walk(&Value::Object(self.0.clone()), target_type)
    }
}

/// A FHIR `Reference` structure (`{ reference, display }`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Reference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self { reference: reference.into(), display: None }
    }

    pub fn with_display(reference: impl Into<String>, display: impl Into<String>) -> Self {
        Self { reference: reference.into(), display: Some(display.into()) }
    }
}

/// A FHIR `Coding` structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    pub system: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// A FHIR `CodeableConcept` structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeableConcept {
    pub coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A FHIR `Quantity` structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: rust_decimal::Decimal,
    pub unit: String,
    pub system: String,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_requires_id() {
        let patient = Resource::new("Patient");
        assert_eq!(patient.reference(), None);
    }

    #[test]
    fn reference_formats_as_type_slash_id() {
        let mut patient = Resource::new("Patient");
        patient.set_id("abc-123");
        assert_eq!(patient.reference().as_deref(), Some("Patient/abc-123"));
    }

    #[test]
    fn from_map_rejects_missing_resource_type() {
        let map = Map::new();
        assert!(Resource::from_map(map).is_err());
    }

    #[test]
    fn has_reference_to_walks_nested_structures() {
        let mut obs = Resource::new("Observation");
        obs.set(
            "subject",
            serde_json::json!({"reference": "Patient/42"}),
        );
        assert!(obs.has_reference_to("Patient"));
        assert!(!obs.has_reference_to("Encounter"));
    }
}
