//! Reference Manager (C3): canonical `Type/id` reference formatting,
//! display-text derivation, a process-wide resource cache for reference
//! resolution, and a forward/reverse index of which resources reference
//! which.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use fhir_pipeline_models::Resource;
use regex::Regex;
use serde_json::{json, Value};

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([A-Za-z][A-Za-z0-9]*/[A-Za-z0-9\-.]{1,64}(/_history/[A-Za-z0-9\-.]{1,64})?|https?://.+/[A-Za-z][A-Za-z0-9]*/[A-Za-z0-9\-.]{1,64})$",
        )
        .unwrap()
    })
}

#[derive(Default)]
struct Index {
    /// resource reference -> set of references it points to
    forward: HashMap<String, HashSet<String>>,
    /// target reference -> set of resources that reference it
    reverse: HashMap<String, HashSet<String>>,
}

/// Tracks every resource created during the pipeline's lifetime so that
/// later stages can resolve a bare reference back to the resource it points
/// at (for display synthesis and integrity checks). Shared process-wide
/// behind an `Arc`; call [`ReferenceManager::clear`] between pipeline runs
/// to keep it from growing without bound.
pub struct ReferenceManager {
    cache: Mutex<HashMap<String, Resource>>,
    index: Mutex<Index>,
}

impl Default for ReferenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceManager {
    pub fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()), index: Mutex::new(Index::default()) }
    }

    pub fn validate_reference_format(reference: &str) -> bool {
        !reference.is_empty() && reference_re().is_match(reference)
    }

    /// Canonical `Type/id` string for a resource, minting an id if the
    /// resource doesn't yet have one.
    pub fn reference_for(&self, resource: &mut Resource) -> String {
        if resource.id().is_none() {
            resource.set_id(generate_resource_id(resource.resource_type()));
        }
        resource.reference().expect("id just assigned")
    }

    /// Mints an id if needed, caches the resource for later resolution, and
    /// returns its canonical reference string.
    pub fn create_reference(&self, resource: &mut Resource) -> String {
        let reference = self.reference_for(resource);
        self.cache_resource(resource);
        reference
    }

    /// [`Self::create_reference`] plus a `{reference, display}` object,
    /// with `display` falling back to [`Self::derive_display_text`].
    pub fn create_reference_dict(&self, resource: &mut Resource, display: Option<&str>) -> Value {
        let reference = self.create_reference(resource);
        let display = display.map(str::to_string).or_else(|| Self::derive_display_text(resource));
        let mut obj = json!({ "reference": reference });
        if let Some(display) = display {
            obj["display"] = Value::String(display);
        }
        obj
    }

    /// Registers an already-built resource (id required) in the cache and
    /// indexes every reference it carries. Factories call this once per
    /// created resource, right after an id is assigned.
    pub fn cache_resource(&self, resource: &Resource) {
        let Some(own_reference) = resource.reference() else { return };
        let targets = collect_references(resource.as_map());
        self.cache.lock().unwrap().insert(own_reference.clone(), resource.clone());
        if !targets.is_empty() {
            let mut index = self.index.lock().unwrap();
            for target in targets {
                index.forward.entry(own_reference.clone()).or_default().insert(target.clone());
                index.reverse.entry(target).or_default().insert(own_reference.clone());
            }
        }
    }

    /// Normalizes a bare id or `Type/id` string into a `{reference}`
    /// object, filling in `display` from the cache when the target
    /// resource has already been created, else from `fallback_display`.
    pub fn reference_dict_for(&self, raw: &str, default_type: &str, fallback_display: Option<&str>) -> Value {
        let reference = normalize_reference(raw, default_type);
        let cached = self.cache.lock().unwrap().get(&reference).cloned();
        let display = cached
            .as_ref()
            .and_then(Self::derive_display_text)
            .or_else(|| fallback_display.map(str::to_string));
        let mut obj = json!({ "reference": reference });
        if let Some(display) = display {
            obj["display"] = Value::String(display);
        }
        obj
    }

    /// Resolves a reference string (stripping a `/_history/...` suffix or
    /// absolute-URL prefix first) back to the resource it points at, if
    /// that resource has been cached.
    pub fn resolve_reference(&self, reference: &str) -> Option<Resource> {
        let cleaned = clean_reference(reference);
        self.cache.lock().unwrap().get(&cleaned).cloned()
    }

    /// Lists every forward reference whose target was never cached, i.e.
    /// every dangling link produced so far.
    pub fn validate_reference_integrity(&self) -> Vec<String> {
        let index = self.index.lock().unwrap();
        let cache = self.cache.lock().unwrap();
        let mut dangling: Vec<String> = index
            .forward
            .values()
            .flatten()
            .filter(|target| !cache.contains_key(*target))
            .cloned()
            .collect();
        dangling.sort();
        dangling.dedup();
        dangling
    }

    /// Drops the resource cache and relationship index. Call at the start
    /// of each pipeline run so state from a previous request can't leak
    /// into the next one's display synthesis or integrity check.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
        *self.index.lock().unwrap() = Index::default();
    }

    /// Heuristic display text: name for person-like resources, plain
    /// `name` for organizational ones, first coding's display (else code)
    /// for clinical ones, else nothing.
    fn derive_display_text(resource: &Resource) -> Option<String> {
        match resource.resource_type() {
            "Patient" | "Practitioner" | "RelatedPerson" => resource
                .get("name")
                .and_then(Value::as_array)
                .and_then(|names| names.first())
                .and_then(Self::name_to_text),
            "Organization" | "Location" | "Device" => {
                resource.get("name").and_then(Value::as_str).map(str::to_string)
            }
            "Medication" | "Condition" | "Observation" => resource
                .get("code")
                .and_then(Self::coding_display_or_code)
                .or_else(|| resource.get("code").and_then(|c| c.get("text")).and_then(Value::as_str).map(str::to_string)),
            _ => None,
        }
    }

    fn coding_display_or_code(codeable_concept: &Value) -> Option<String> {
        let first = codeable_concept.get("coding").and_then(Value::as_array).and_then(|c| c.first())?;
        first
            .get("display")
            .and_then(Value::as_str)
            .or_else(|| first.get("code").and_then(Value::as_str))
            .map(str::to_string)
    }

    fn name_to_text(name: &Value) -> Option<String> {
        if let Some(text) = name.get("text").and_then(Value::as_str) {
            return Some(text.to_string());
        }
        let given = name
            .get("given")
            .and_then(Value::as_array)
            .map(|parts| parts.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" "));
        let family = name.get("family").and_then(Value::as_str);
        match (given, family) {
            (Some(g), Some(f)) if !g.is_empty() => Some(format!("{g} {f}")),
            (_, Some(f)) => Some(f.to_string()),
            (Some(g), None) if !g.is_empty() => Some(g),
            _ => None,
        }
    }

    pub fn record_relationship(&self, source_reference: &str, target_reference: &str) {
        let mut index = self.index.lock().unwrap();
        index.forward.entry(source_reference.to_string()).or_default().insert(target_reference.to_string());
        index.reverse.entry(target_reference.to_string()).or_default().insert(source_reference.to_string());
    }

    pub fn references_from(&self, source_reference: &str) -> HashSet<String> {
        self.index.lock().unwrap().forward.get(source_reference).cloned().unwrap_or_default()
    }

    pub fn references_to(&self, target_reference: &str) -> HashSet<String> {
        self.index.lock().unwrap().reverse.get(target_reference).cloned().unwrap_or_default()
    }
}

fn generate_resource_id(resource_type: &str) -> String {
    format!("{resource_type}-{}", uuid::Uuid::new_v4())
}

/// Bare id or `Type/id` string into a canonical `Type/id` string,
/// defaulting the type when given a bare id.
fn normalize_reference(raw: &str, default_type: &str) -> String {
    if raw.contains('/') {
        clean_reference(raw)
    } else {
        format!("{default_type}/{raw}")
    }
}

/// Strips a `/_history/<version>` suffix, and collapses an absolute URL
/// down to its trailing `Type/id` segments.
fn clean_reference(raw: &str) -> String {
    let without_history = raw.split("/_history/").next().unwrap_or(raw);
    if without_history.starts_with("http://") || without_history.starts_with("https://") {
        let segments: Vec<&str> = without_history.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() >= 2 {
            return segments[segments.len() - 2..].join("/");
        }
    }
    without_history.to_string()
}

fn collect_references(map: &serde_json::Map<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for value in map.values() {
        collect_references_into(value, &mut out);
    }
    out
}

fn collect_references_into(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(r)) = map.get("reference") {
                out.push(clean_reference(r));
            }
            for v in map.values() {
                collect_references_into(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references_into(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_type_slash_id_shape() {
        assert!(ReferenceManager::validate_reference_format("Patient/abc-123"));
        assert!(!ReferenceManager::validate_reference_format("patient-abc"));
    }

    #[test]
    fn validates_history_suffixed_references() {
        assert!(ReferenceManager::validate_reference_format("Patient/abc/_history/2"));
    }

    #[test]
    fn derives_patient_display_from_name() {
        let mut patient = Resource::new("Patient");
        patient.set("name", json!([{"given": ["Jane"], "family": "Doe"}]));
        let manager = ReferenceManager::new();
        let dict = manager.create_reference_dict(&mut patient, None);
        assert_eq!(dict["display"], "Jane Doe");
    }

    #[test]
    fn derives_condition_display_from_first_coding() {
        let mut condition = Resource::new("Condition");
        condition.set_id("c1");
        condition.set("code", json!({ "coding": [{ "system": "http://snomed.info/sct", "code": "386661006", "display": "Fever" }] }));
        let manager = ReferenceManager::new();
        manager.cache_resource(&condition);
        let dict = manager.reference_dict_for("c1", "Condition", None);
        assert_eq!(dict["display"], "Fever");
    }

    #[test]
    fn condition_display_falls_back_to_code_then_text() {
        let mut condition = Resource::new("Condition");
        condition.set_id("c1");
        condition.set("code", json!({ "coding": [{ "system": "http://snomed.info/sct", "code": "386661006" }] }));
        let manager = ReferenceManager::new();
        manager.cache_resource(&condition);
        let dict = manager.reference_dict_for("c1", "Condition", None);
        assert_eq!(dict["display"], "386661006");
    }

    #[test]
    fn reference_dict_for_uses_fallback_display_when_uncached() {
        let manager = ReferenceManager::new();
        let dict = manager.reference_dict_for("p1", "Patient", Some("Jane Doe"));
        assert_eq!(dict["reference"], "Patient/p1");
        assert_eq!(dict["display"], "Jane Doe");
    }

    #[test]
    fn reference_dict_for_has_no_display_when_unresolvable() {
        let manager = ReferenceManager::new();
        let dict = manager.reference_dict_for("p1", "Patient", None);
        assert!(dict.get("display").is_none());
    }

    #[test]
    fn resolve_reference_round_trips_created_reference() {
        let mut patient = Resource::new("Patient");
        patient.set_id("p1");
        let manager = ReferenceManager::new();
        let reference = manager.create_reference(&mut patient);
        let resolved = manager.resolve_reference(&reference).unwrap();
        assert_eq!(resolved.resource_type(), "Patient");
        assert_eq!(resolved.id(), Some("p1"));
    }

    #[test]
    fn resolve_reference_strips_history_suffix_and_absolute_prefix() {
        let mut patient = Resource::new("Patient");
        patient.set_id("p1");
        let manager = ReferenceManager::new();
        manager.cache_resource(&patient);
        assert!(manager.resolve_reference("Patient/p1/_history/3").is_some());
        assert!(manager.resolve_reference("https://example.org/fhir/Patient/p1").is_some());
    }

    #[test]
    fn validate_reference_integrity_flags_dangling_target() {
        let mut condition = Resource::new("Condition");
        condition.set_id("c1");
        condition.set("subject", json!({ "reference": "Patient/missing" }));
        let manager = ReferenceManager::new();
        manager.cache_resource(&condition);
        let dangling = manager.validate_reference_integrity();
        assert_eq!(dangling, vec!["Patient/missing".to_string()]);
    }

    #[test]
    fn validate_reference_integrity_is_clean_when_target_cached() {
        let mut patient = Resource::new("Patient");
        patient.set_id("p1");
        let mut condition = Resource::new("Condition");
        condition.set_id("c1");
        condition.set("subject", json!({ "reference": "Patient/p1" }));

        let manager = ReferenceManager::new();
        manager.cache_resource(&patient);
        manager.cache_resource(&condition);
        assert!(manager.validate_reference_integrity().is_empty());
    }

    #[test]
    fn clear_drops_cache_and_index() {
        let mut patient = Resource::new("Patient");
        patient.set_id("p1");
        let manager = ReferenceManager::new();
        manager.cache_resource(&patient);
        manager.clear();
        assert!(manager.resolve_reference("Patient/p1").is_none());
        assert!(manager.validate_reference_integrity().is_empty());
    }

    #[test]
    fn relationship_index_is_bidirectional() {
        let manager = ReferenceManager::new();
        manager.record_relationship("Observation/1", "Patient/1");
        assert!(manager.references_from("Observation/1").contains("Patient/1"));
        assert!(manager.references_to("Patient/1").contains("Observation/1"));
    }
}
