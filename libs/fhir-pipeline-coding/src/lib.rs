//! Registry of medical coding systems (C1): system-URI lookup, FHIR
//! `Coding`/`CodeableConcept`/`Quantity` construction, and per-system code
//! format validation.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use lru::LruCache;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use thiserror::Error;

/// Cap shared by every cache this registry keeps (coding lookups and code
/// validations), per spec.
const CACHE_CAPACITY: usize = 256;

/// One entry of a multi-system `create_multiple_codings` call.
pub struct CodingInput<'a> {
    pub system: &'a str,
    pub code: &'a str,
    pub display: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum CodingError {
    #[error("unknown coding system: {0}")]
    UnknownSystem(String),
    #[error("invalid code format for {system}: {code}")]
    InvalidCode { system: String, code: String },
}

fn loinc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{5}-\d$").unwrap())
}

fn icd10_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]\d{2}(\.\d{1,4})?$").unwrap())
}

fn cpt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{5}$").unwrap())
}

fn generic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-._]+$").unwrap())
}

/// Registry of coding-system short names to canonical URIs, plus
/// per-system code format validation. One instance is shared process-wide
/// behind an `Arc`; the internal `Mutex` only protects the custom-system
/// registration table, since the standard table never mutates after
/// construction.
pub struct CodingRegistry {
    systems: HashMap<&'static str, &'static str>,
    custom_systems: Mutex<HashMap<String, String>>,
    coding_cache: Mutex<LruCache<String, Value>>,
    validation_cache: Mutex<LruCache<(String, String), bool>>,
}

impl Default for CodingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodingRegistry {
    pub fn new() -> Self {
        let mut systems = HashMap::new();
        systems.insert("LOINC", "http://loinc.org");
        systems.insert("SNOMED", "http://snomed.info/sct");
        systems.insert("SNOMED-CT", "http://snomed.info/sct");
        systems.insert("RXNORM", "http://www.nlm.nih.gov/research/umls/rxnorm");
        systems.insert("NDC", "http://hl7.org/fhir/sid/ndc");
        systems.insert("ICD10", "http://hl7.org/fhir/sid/icd-10");
        systems.insert("ICD10CM", "http://hl7.org/fhir/sid/icd-10-cm");
        systems.insert("ICD10PCS", "http://hl7.org/fhir/sid/icd-10-pcs");
        systems.insert("CPT", "http://www.ama-assn.org/go/cpt");
        systems.insert("UCUM", "http://unitsofmeasure.org");
        systems.insert("NPI", "http://hl7.org/fhir/sid/us-npi");
        systems.insert("CVX", "http://hl7.org/fhir/sid/cvx");
        systems.insert("HL7", "http://terminology.hl7.org/CodeSystem/");
        Self {
            systems,
            custom_systems: Mutex::new(HashMap::new()),
            coding_cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
            validation_cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    pub fn system_uri(&self, name: &str) -> Option<String> {
        let upper = name.to_uppercase();
        if let Some(uri) = self.systems.get(upper.as_str()) {
            return Some((*uri).to_string());
        }
        self.custom_systems.lock().unwrap().get(&upper).cloned()
    }

    pub fn register_custom_system(&self, name: &str, uri: &str) {
        self.custom_systems
            .lock()
            .unwrap()
            .insert(name.to_uppercase(), uri.to_string());
        tracing::info!(name, uri, "registered custom coding system");
    }

    /// Validate a code's format against the rules for its coding system URI.
    pub fn validate_code(&self, system: &str, code: &str) -> bool {
        let key = (system.to_string(), code.to_string());
        if let Some(cached) = self.validation_cache.lock().unwrap().get(&key) {
            return *cached;
        }

        let valid = if code.trim().is_empty() {
            false
        } else {
            let system_lower = system.to_lowercase();
            if system_lower.contains("loinc.org") {
                loinc_re().is_match(code)
            } else if system_lower.contains("snomed.info") {
                code.chars().all(|c| c.is_ascii_digit()) && code.len() >= 6
            } else if system_lower.contains("rxnorm") {
                !code.is_empty() && code.chars().all(|c| c.is_ascii_digit())
            } else if system_lower.contains("icd-10") {
                icd10_re().is_match(&code.to_uppercase())
            } else if system_lower.contains("cpt") {
                cpt_re().is_match(code)
            } else if system_lower.contains("cvx") {
                !code.is_empty() && code.len() <= 3 && code.chars().all(|c| c.is_ascii_digit())
            } else if system_lower.contains("ndc") {
                let digits: String = code.chars().filter(|c| *c != '-').collect();
                digits.chars().all(|c| c.is_ascii_digit()) && matches!(digits.len(), 10 | 11)
            } else {
                generic_re().is_match(code)
            }
        };

        self.validation_cache.lock().unwrap().put(key, valid);
        valid
    }

    /// Resolve `system` to its URI (passing absolute URIs through unchanged)
    /// and validate `code` against it, producing a FHIR `Coding` as JSON.
    pub fn create_coding(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
    ) -> Result<Value, CodingError> {
        let system_uri = self.resolve_system(system)?;
        let cache_key = format!("{system_uri}|{code}|{}", display.unwrap_or(""));
        if let Some(cached) = self.coding_cache.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        if !self.validate_code(&system_uri, code) {
            return Err(CodingError::InvalidCode { system: system_uri, code: code.to_string() });
        }
        let mut coding = json!({ "system": system_uri, "code": code });
        if let Some(display) = display {
            coding["display"] = json!(display);
        }

        self.coding_cache.lock().unwrap().put(cache_key, coding.clone());
        Ok(coding)
    }

    pub fn create_codeable_concept(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
        text: Option<&str>,
    ) -> Result<Value, CodingError> {
        let coding = self.create_coding(system, code, display)?;
        let mut concept = json!({ "coding": [coding] });
        if let Some(text) = text.or(display) {
            concept["text"] = json!(text);
        }
        Ok(concept)
    }

    /// Build a `CodeableConcept` spanning multiple coding systems (e.g. a
    /// condition coded in both SNOMED and ICD-10). The first coding's
    /// display, falling back to its code, supplies `text`.
    pub fn create_multiple_codings(&self, codings: &[CodingInput<'_>]) -> Result<Value, CodingError> {
        let mut coding_objects = Vec::with_capacity(codings.len());
        for input in codings {
            coding_objects.push(self.create_coding(input.system, input.code, input.display)?);
        }

        let text = codings.first().map(|first| first.display.unwrap_or(first.code).to_string());
        let mut concept = json!({ "coding": coding_objects });
        if let Some(text) = text {
            concept["text"] = json!(text);
        }
        Ok(concept)
    }

    /// Build a FHIR `Quantity`. Per spec, the default system is UCUM; an
    /// unrecognized `system` name is passed through as a literal URI rather
    /// than rejected, matching the original behavior.
    pub fn create_quantity(&self, value: Decimal, unit: &str, system: Option<&str>) -> Value {
        let system_name = system.unwrap_or("UCUM");
        let system_uri = self.system_uri(system_name).unwrap_or_else(|| system_name.to_string());
        json!({ "value": value, "unit": unit, "system": system_uri, "code": unit })
    }

    fn resolve_system(&self, system: &str) -> Result<String, CodingError> {
        if system.starts_with("http") {
            return Ok(system.to_string());
        }
        self.system_uri(system).ok_or_else(|| CodingError::UnknownSystem(system.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loinc_codes_require_ndddd_d_shape() {
        let registry = CodingRegistry::new();
        assert!(registry.validate_code("http://loinc.org", "12345-6"));
        assert!(!registry.validate_code("http://loinc.org", "12345"));
    }

    #[test]
    fn icd10_accepts_optional_decimal_extension() {
        let registry = CodingRegistry::new();
        assert!(registry.validate_code("http://hl7.org/fhir/sid/icd-10-cm", "E11.9"));
        assert!(registry.validate_code("http://hl7.org/fhir/sid/icd-10-cm", "E11"));
        assert!(!registry.validate_code("http://hl7.org/fhir/sid/icd-10-cm", "11.9"));
    }

    #[test]
    fn create_coding_rejects_invalid_code_for_known_system() {
        let registry = CodingRegistry::new();
        let err = registry.create_coding("LOINC", "bad-code", None).unwrap_err();
        assert!(matches!(err, CodingError::InvalidCode { .. }));
    }

    #[test]
    fn create_coding_resolves_short_name_to_uri() {
        let registry = CodingRegistry::new();
        let coding = registry.create_coding("SNOMED", "386661006", Some("Fever")).unwrap();
        assert_eq!(coding["system"], "http://snomed.info/sct");
        assert_eq!(coding["display"], "Fever");
    }

    #[test]
    fn unknown_system_name_is_rejected_unless_absolute_uri() {
        let registry = CodingRegistry::new();
        assert!(registry.create_coding("NOT-A-SYSTEM", "123", None).is_err());
        assert!(registry.create_coding("http://example.org/codes", "abc", None).is_ok());
    }

    #[test]
    fn custom_systems_register_and_resolve() {
        let registry = CodingRegistry::new();
        registry.register_custom_system("local-labs", "http://example.org/local-labs");
        assert_eq!(registry.system_uri("local-labs").as_deref(), Some("http://example.org/local-labs"));
    }

    #[test]
    fn repeated_coding_lookup_hits_cache() {
        let registry = CodingRegistry::new();
        let first = registry.create_coding("LOINC", "12345-6", Some("Glucose")).unwrap();
        let second = registry.create_coding("LOINC", "12345-6", Some("Glucose")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn create_multiple_codings_uses_first_coding_for_text_fallback() {
        let registry = CodingRegistry::new();
        let concept = registry
            .create_multiple_codings(&[
                CodingInput { system: "SNOMED", code: "386661006", display: Some("Fever") },
                CodingInput { system: "ICD10CM", code: "R50.9", display: None },
            ])
            .unwrap();
        assert_eq!(concept["coding"].as_array().unwrap().len(), 2);
        assert_eq!(concept["text"], "Fever");
    }

    #[test]
    fn create_multiple_codings_falls_back_to_code_when_first_has_no_display() {
        let registry = CodingRegistry::new();
        let concept = registry
            .create_multiple_codings(&[CodingInput { system: "ICD10CM", code: "R50.9", display: None }])
            .unwrap();
        assert_eq!(concept["text"], "R50.9");
    }

    #[test]
    fn create_multiple_codings_rejects_first_bad_code() {
        let registry = CodingRegistry::new();
        let err = registry
            .create_multiple_codings(&[CodingInput { system: "LOINC", code: "bad", display: None }])
            .unwrap_err();
        assert!(matches!(err, CodingError::InvalidCode { .. }));
    }
}
