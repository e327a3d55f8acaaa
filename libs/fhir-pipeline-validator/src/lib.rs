//! Structural FHIR R4 validation (C2): required fields, reference shape,
//! coding shape, date shape, id shape, and resourceType shape. This is not
//! terminology or profile validation — that lives on the external FHIR
//! server and is invoked separately by the validation service (C11).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use fhir_pipeline_models::{Resource, ValidationIssue, ValidationIssueSeverity, ValidationResult};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*/[A-Za-z0-9\-.]{1,64}$").unwrap())
}

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-.]{1,64}$").unwrap())
}

fn resource_type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").unwrap())
}

fn uri_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*:\S+$").unwrap())
}

fn required_fields() -> &'static HashMap<&'static str, &'static [&'static str]> {
    static MAP: OnceLock<HashMap<&'static str, &'static [&'static str]>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("Patient", &["resourceType"][..]),
            ("MedicationRequest", &["resourceType", "subject", "medicationCodeableConcept"][..]),
            (
                "MedicationAdministration",
                &["resourceType", "subject", "medicationCodeableConcept", "status"][..],
            ),
            ("Observation", &["resourceType", "subject", "code", "status"][..]),
            ("Device", &["resourceType"][..]),
            ("DeviceUseStatement", &["resourceType", "subject", "device"][..]),
            ("ServiceRequest", &["resourceType", "subject", "code", "status"][..]),
            ("Condition", &["resourceType", "subject", "code"][..]),
            ("Encounter", &["resourceType", "subject", "status", "class"][..]),
            ("DiagnosticReport", &["resourceType", "subject", "code", "status"][..]),
            ("AllergyIntolerance", &["resourceType", "patient", "code"][..]),
            ("Medication", &["resourceType"][..]),
            ("CarePlan", &["resourceType", "subject", "status"][..]),
            ("Immunization", &["resourceType", "patient", "vaccineCode", "status"][..]),
            ("Location", &["resourceType"][..]),
            ("Consent", &["resourceType", "status", "scope", "category"][..]),
        ])
    })
}

/// Registry of structural FHIR R4 validators, memoized on a digest of the
/// resource's canonical JSON so repeated validation of the same resource
/// (e.g. across a retry) is free.
pub struct ValidatorRegistry {
    cache: Mutex<lru::LruCache<String, ValidationResult>>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self { cache: Mutex::new(lru::LruCache::new(NonZeroUsize::new(512).unwrap())) }
    }

    pub fn validate_resource(&self, resource: &Resource) -> ValidationResult {
        let digest = Self::digest(resource.as_map());
        if let Some(cached) = self.cache.lock().unwrap().get(&digest) {
            return cached.clone();
        }

        let mut issues = Vec::new();
        let value = Value::Object(resource.as_map().clone());

        Self::check_resource_type(&value, &mut issues);
        Self::check_id_format(&value, &mut issues);
        Self::check_required_fields(&value, &mut issues);
        Self::check_references_recursive(&value, "$", &mut issues);
        Self::check_codings_recursive(&value, "$", &mut issues);
        Self::check_dates_recursive(&value, "$", &mut issues);
        Self::check_identifiers_recursive(&value, "$", &mut issues);

        let valid = issues.is_empty();
        let result = ValidationResult {
            valid,
            issues,
            bundle_quality_score: if valid { 1.0 } else { 0.3 },
            validation_source: fhir_pipeline_models::ValidationSource::Local,
            validation_result: if valid { "passed".to_string() } else { "failed".to_string() },
        };
        self.cache.lock().unwrap().put(digest, result.clone());
        result
    }

    /// Structural validation of an entire bundle: every entry's resource is
    /// checked independently and the results merged, with issue paths
    /// rewritten to point at the owning entry index.
    pub fn validate_bundle(&self, bundle: &fhir_pipeline_models::Bundle) -> ValidationResult {
        let mut combined = ValidationResult::ok();
        combined.bundle_quality_score = 0.0;
        let mut count = 0usize;
        for (idx, entry) in bundle.entry.iter().enumerate() {
            let mut result = self.validate_resource(&entry.resource);
            for issue in &mut result.issues {
                issue.path = format!("entry[{idx}].resource.{}", issue.path.trim_start_matches("$."));
            }
            combined.bundle_quality_score += result.bundle_quality_score;
            count += 1;
            combined.merge(result);
        }
        if count > 0 {
            combined.bundle_quality_score /= count as f64;
        } else {
            combined.bundle_quality_score = 1.0;
        }
        combined.validation_result = if combined.valid { "passed".to_string() } else { "failed".to_string() };
        combined
    }

    fn digest(map: &serde_json::Map<String, Value>) -> String {
        let canonical = serde_json::to_string(&sorted(map)).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn check_resource_type(value: &Value, issues: &mut Vec<ValidationIssue>) {
        let Some(rt) = value.get("resourceType").and_then(Value::as_str) else {
            issues.push(error("$.resourceType", "resourceType is required"));
            return;
        };
        if !resource_type_re().is_match(rt) {
            issues.push(error("$.resourceType", "resourceType must start with an uppercase letter"));
        }
    }

    fn check_id_format(value: &Value, issues: &mut Vec<ValidationIssue>) {
        match value.get("id") {
            None | Some(Value::Null) => {}
            Some(Value::String(id)) if id_re().is_match(id) => {}
            Some(_) => issues.push(error("$.id", "id must match [A-Za-z0-9-.]{1,64}")),
        }
    }

    fn check_required_fields(value: &Value, issues: &mut Vec<ValidationIssue>) {
        let Some(rt) = value.get("resourceType").and_then(Value::as_str) else { return };
        let Some(fields) = required_fields().get(rt) else { return };
        for field in *fields {
            if !field_present(value, field) {
                issues.push(error(&format!("$.{field}"), &format!("{rt} requires field '{field}'")));
            }
        }
    }

    fn check_references_recursive(value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    if key == "reference" {
                        if let Value::String(r) = v {
                            if !reference_re().is_match(r) && !r.starts_with("http") {
                                issues.push(error(path, &format!("invalid reference format: {r}")));
                            }
                        }
                    } else {
                        Self::check_references_recursive(v, &format!("{path}.{key}"), issues);
                    }
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    Self::check_references_recursive(item, &format!("{path}[{i}]"), issues);
                }
            }
            _ => {}
        }
    }

    fn check_codings_recursive(value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
        if let Value::Object(map) = value {
            if let (Some(system), Some(code)) = (map.get("system"), map.get("code")) {
                let system_ok = matches!(system, Value::String(s) if !s.is_empty());
                let code_ok = matches!(code, Value::String(c) if !c.trim().is_empty());
                if !system_ok || !code_ok {
                    issues.push(error(path, "Coding requires non-empty system and code"));
                }
            }
            for (key, v) in map {
                Self::check_codings_recursive(v, &format!("{path}.{key}"), issues);
            }
        } else if let Value::Array(items) = value {
            for (i, item) in items.iter().enumerate() {
                Self::check_codings_recursive(item, &format!("{path}[{i}]"), issues);
            }
        }
    }

    /// Every `identifier` array entry needs a non-empty `value`; when it
    /// carries a `system` at all, that system must be a URI.
    fn check_identifiers_recursive(value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
        if let Value::Object(map) = value {
            if let Some(Value::Array(identifiers)) = map.get("identifier") {
                for (i, identifier) in identifiers.iter().enumerate() {
                    let item_path = format!("{path}.identifier[{i}]");
                    let value_ok = matches!(identifier.get("value"), Some(Value::String(v)) if !v.trim().is_empty());
                    if !value_ok {
                        issues.push(error(&item_path, "Identifier requires a non-empty value"));
                    }
                    if let Some(system) = identifier.get("system") {
                        let system_ok = matches!(system, Value::String(s) if uri_re().is_match(s));
                        if !system_ok {
                            issues.push(error(&format!("{item_path}.system"), "Identifier system must be a URI"));
                        }
                    }
                }
            }
            for (key, v) in map {
                if key != "identifier" {
                    Self::check_identifiers_recursive(v, &format!("{path}.{key}"), issues);
                }
            }
        } else if let Value::Array(items) = value {
            for (i, item) in items.iter().enumerate() {
                Self::check_identifiers_recursive(item, &format!("{path}[{i}]"), issues);
            }
        }
    }

    fn check_dates_recursive(value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
        const DATE_FIELDS: &[&str] = &["date", "dateTime", "effectiveDateTime", "authoredOn", "created"];
        if let Value::Object(map) = value {
            for (key, v) in map {
                if DATE_FIELDS.contains(&key.as_str()) {
                    if let Value::String(s) = v {
                        if !is_valid_fhir_date(s) {
                            issues.push(error(&format!("{path}.{key}"), &format!("invalid FHIR date: {s}")));
                        }
                    }
                } else {
                    Self::check_dates_recursive(v, &format!("{path}.{key}"), issues);
                }
            }
        } else if let Value::Array(items) = value {
            for (i, item) in items.iter().enumerate() {
                Self::check_dates_recursive(item, &format!("{path}[{i}]"), issues);
            }
        }
    }
}

fn field_present(value: &Value, field: &str) -> bool {
    value.get(field).map(|v| !v.is_null()).unwrap_or(false)
}

fn error(path: &str, message: &str) -> ValidationIssue {
    ValidationIssue {
        severity: ValidationIssueSeverity::Error,
        path: path.to_string(),
        message: message.to_string(),
    }
}

fn is_valid_fhir_date(s: &str) -> bool {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"^\d{4}$",
            r"^\d{4}-\d{2}$",
            r"^\d{4}-\d{2}-\d{2}$",
            r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})$",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    patterns.iter().any(|re| re.is_match(s))
}

/// Recursively sort object keys so the JSON digest is stable regardless of
/// insertion order.
fn sorted(map: &serde_json::Map<String, Value>) -> Value {
    fn sort_value(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted_map = serde_json::Map::new();
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for key in keys {
                    sorted_map.insert(key.clone(), sort_value(&map[key]));
                }
                Value::Object(sorted_map)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
            other => other.clone(),
        }
    }
    sort_value(&Value::Object(map.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir_pipeline_models::Resource;

    #[test]
    fn observation_without_status_fails_required_fields() {
        let registry = ValidatorRegistry::new();
        let mut obs = Resource::new("Observation");
        obs.set("subject", serde_json::json!({"reference": "Patient/1"}));
        obs.set("code", serde_json::json!({"coding": []}));
        let result = registry.validate_resource(&obs);
        assert!(!result.valid);
        assert!(result.issues.iter().any(|i| i.path.contains("status")));
    }

    #[test]
    fn valid_patient_passes() {
        let registry = ValidatorRegistry::new();
        let mut patient = Resource::new("Patient");
        patient.set_id("abc");
        let result = registry.validate_resource(&patient);
        assert!(result.valid, "{:?}", result.issues);
    }

    #[test]
    fn malformed_reference_is_flagged() {
        let registry = ValidatorRegistry::new();
        let mut obs = Resource::new("Observation");
        obs.set("subject", serde_json::json!({"reference": "not-a-reference"}));
        obs.set("code", serde_json::json!({"coding": [{"system": "http://loinc.org", "code": "12345-6"}]}));
        obs.set("status", serde_json::json!("final"));
        let result = registry.validate_resource(&obs);
        assert!(!result.valid);
    }

    #[test]
    fn identifier_with_empty_value_is_flagged() {
        let registry = ValidatorRegistry::new();
        let mut patient = Resource::new("Patient");
        patient.set("identifier", serde_json::json!([{"system": "http://example.org/mrn", "value": ""}]));
        let result = registry.validate_resource(&patient);
        assert!(!result.valid);
        assert!(result.issues.iter().any(|i| i.message.contains("non-empty value")));
    }

    #[test]
    fn identifier_with_non_uri_system_is_flagged() {
        let registry = ValidatorRegistry::new();
        let mut patient = Resource::new("Patient");
        patient.set("identifier", serde_json::json!([{"system": "not-a-uri", "value": "12345"}]));
        let result = registry.validate_resource(&patient);
        assert!(!result.valid);
        assert!(result.issues.iter().any(|i| i.message.contains("must be a URI")));
    }

    #[test]
    fn identifier_without_system_is_allowed() {
        let registry = ValidatorRegistry::new();
        let mut patient = Resource::new("Patient");
        patient.set("identifier", serde_json::json!([{"value": "12345"}]));
        let result = registry.validate_resource(&patient);
        assert!(result.valid, "{:?}", result.issues);
    }

    #[test]
    fn repeated_validation_hits_cache() {
        let registry = ValidatorRegistry::new();
        let mut patient = Resource::new("Patient");
        patient.set_id("abc");
        let first = registry.validate_resource(&patient);
        let second = registry.validate_resource(&patient);
        assert_eq!(first.valid, second.valid);
    }
}
