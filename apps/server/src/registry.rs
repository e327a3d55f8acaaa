//! Factory Registry (C6): resource-type to factory mapping, lazy
//! instantiation, feature-flag-gated selection, singleton lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use fhir_pipeline_coding::CodingRegistry;
use fhir_pipeline_reference::ReferenceManager;
use fhir_pipeline_validator::ValidatorRegistry;

use crate::factories::{
    base::{FactoryContext, ResourceFactory},
    careplan::CarePlanFactory,
    clinical::ClinicalFactory,
    consent::ConsentFactory,
    device::DeviceFactory,
    encounter::EncounterFactory,
    medication::MedicationFactory,
    organizational::OrganizationalFactory,
    patient::PatientFactory,
};

/// Feature flags gating which factory a resource type resolves to. All
/// default `true`; flipping one off falls back to the shared generic
/// factory for that family, the same generic-factory fallback the teacher's
/// own feature-flagged hook chain uses when a named hook is disabled.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub use_new_patient_factory: bool,
    pub use_new_medication_factory: bool,
    pub use_new_clinical_factory: bool,
    pub use_new_careplan_factory: bool,
    pub use_new_encounter_factory: bool,
    pub use_legacy_factory: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            use_new_patient_factory: true,
            use_new_medication_factory: true,
            use_new_clinical_factory: true,
            use_new_careplan_factory: true,
            use_new_encounter_factory: true,
            use_legacy_factory: false,
        }
    }
}

/// A minimal factory used when a feature flag disables the specialized one,
/// or for resource types no specialized factory claims. Still routes
/// through C1/C2/C3 via `FactoryContext`, it just doesn't know any of the
/// specialized families' semantic input shapes.
struct GenericFactory {
    context: FactoryContext,
    metrics: crate::factories::base::FactoryMetrics,
}

impl ResourceFactory for GenericFactory {
    fn name(&self) -> &'static str {
        "GenericResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &crate::factories::base::FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, _resource_type: &str) -> bool {
        true
    }

    fn build(
        &self,
        resource_type: &str,
        data: &serde_json::Value,
        _request_id: Option<&str>,
    ) -> crate::error::Result<fhir_pipeline_models::Resource> {
        let mut resource = fhir_pipeline_models::Resource::new(resource_type);
        if let serde_json::Value::Object(map) = data {
            for (key, value) in map {
                resource.set(key, value.clone());
            }
        }
        Ok(resource)
    }
}

/// Which specialized factory family owns a resource type, independent of
/// whether its feature flag is currently on.
fn family_for(resource_type: &str) -> Option<&'static str> {
    match resource_type {
        "Patient" => Some("patient"),
        "MedicationRequest" | "MedicationAdministration" | "MedicationDispense"
        | "MedicationStatement" | "Medication" => Some("medication"),
        "Observation" | "DiagnosticReport" | "ServiceRequest" | "Condition"
        | "AllergyIntolerance" | "RiskAssessment" | "ImagingStudy" => Some("clinical"),
        "Device" | "DeviceUseStatement" | "DeviceMetric" => Some("device"),
        "Encounter" | "Goal" | "CareTeam" => Some("encounter"),
        "CarePlan" => Some("careplan"),
        "Location" | "Organization" | "HealthcareService" => Some("organizational"),
        "Consent" => Some("consent"),
        _ => None,
    }
}

/// Process-wide singleton (C6): a lock-check-load-insert cache of
/// `Arc<dyn ResourceFactory>` keyed by resource type. Construction is cheap
/// and synchronous, so a plain `Mutex` guards the whole map rather than an
/// `RwLock`-plus-async pattern.
pub struct FactoryRegistry {
    context: FactoryContext,
    flags: FeatureFlags,
    reject_synthesized_series_uid: bool,
    safety_validation_enabled: bool,
    cache: Mutex<HashMap<String, Arc<dyn ResourceFactory>>>,
}

impl FactoryRegistry {
    pub fn new(coding: Arc<CodingRegistry>) -> Self {
        Self::with_flags(coding, FeatureFlags::default(), false, true)
    }

    pub fn with_flags(
        coding: Arc<CodingRegistry>,
        flags: FeatureFlags,
        reject_synthesized_series_uid: bool,
        safety_validation_enabled: bool,
    ) -> Self {
        let context = FactoryContext {
            coding,
            validators: Arc::new(ValidatorRegistry::new()),
            references: Arc::new(ReferenceManager::new()),
        };
        Self {
            context,
            flags,
            reject_synthesized_series_uid,
            safety_validation_enabled,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// `clear_cache()` — forces reinstantiation of factories on next lookup.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// The reference manager shared by every factory this registry builds.
    /// The orchestrator clears it at the start of each run so resource
    /// caching and the relationship index don't grow across requests.
    pub fn references(&self) -> &Arc<ReferenceManager> {
        &self.context.references
    }

    /// Resolves (and caches) the factory responsible for `resource_type`.
    /// First lookup builds and inserts it; subsequent lookups hit the map.
    pub fn get(&self, resource_type: &str) -> Arc<dyn ResourceFactory> {
        let family = family_for(resource_type).unwrap_or("generic");

        if let Some(factory) = self.cache.lock().unwrap().get(family) {
            return factory.clone();
        }

        let factory = self.build_factory(family);
        self.cache.lock().unwrap().entry(family.to_string()).or_insert(factory).clone()
    }

    fn build_factory(&self, family: &str) -> Arc<dyn ResourceFactory> {
        if self.flags.use_legacy_factory {
            return self.generic();
        }
        match family {
            "patient" if self.flags.use_new_patient_factory => {
                Arc::new(PatientFactory::new(self.context.clone()))
            }
            "medication" if self.flags.use_new_medication_factory => Arc::new(MedicationFactory::new(
                self.context.clone(),
                self.safety_validation_enabled,
            )),
            "clinical" if self.flags.use_new_clinical_factory => Arc::new(ClinicalFactory::new(
                self.context.clone(),
                self.reject_synthesized_series_uid,
            )),
            "careplan" if self.flags.use_new_careplan_factory => {
                Arc::new(CarePlanFactory::new(self.context.clone()))
            }
            "encounter" if self.flags.use_new_encounter_factory => {
                Arc::new(EncounterFactory::new(self.context.clone()))
            }
            "device" => Arc::new(DeviceFactory::new(self.context.clone())),
            "organizational" => Arc::new(OrganizationalFactory::new(self.context.clone())),
            "consent" => Arc::new(ConsentFactory::new(self.context.clone())),
            _ => self.generic(),
        }
    }

    fn generic(&self) -> Arc<dyn ResourceFactory> {
        Arc::new(GenericFactory {
            context: self.context.clone(),
            metrics: crate::factories::base::FactoryMetrics::default(),
        })
    }

    /// `health_check()` (§4.6): times a throwaway Patient lookup and reports
    /// whether it stayed under the 10ms first-load budget.
    pub fn health_check(&self) -> RegistryHealth {
        self.clear_cache();
        let start = Instant::now();
        let _ = self.get("Patient");
        let first_load = start.elapsed();

        let start = Instant::now();
        let _ = self.get("Patient");
        let cached = start.elapsed();

        RegistryHealth {
            first_load_ok: first_load.as_millis() < 10,
            cached_load_ok: cached.as_secs_f64() < 0.0001,
            first_load_micros: first_load.as_micros() as u64,
            cached_load_micros: cached.as_micros() as u64,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryHealth {
    pub first_load_ok: bool,
    pub cached_load_ok: bool,
    pub first_load_micros: u64,
    pub cached_load_micros: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_patient_to_patient_factory() {
        let registry = FactoryRegistry::new(Arc::new(CodingRegistry::new()));
        let factory = registry.get("Patient");
        assert_eq!(factory.name(), "PatientResourceFactory");
    }

    #[test]
    fn caches_factory_instance_across_lookups() {
        let registry = FactoryRegistry::new(Arc::new(CodingRegistry::new()));
        let a = registry.get("MedicationRequest");
        let b = registry.get("MedicationRequest");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn clear_cache_forces_reinstantiation() {
        let registry = FactoryRegistry::new(Arc::new(CodingRegistry::new()));
        let a = registry.get("Patient");
        registry.clear_cache();
        let b = registry.get("Patient");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn disabled_feature_flag_falls_back_to_generic() {
        let mut flags = FeatureFlags::default();
        flags.use_new_patient_factory = false;
        let registry = FactoryRegistry::with_flags(Arc::new(CodingRegistry::new()), flags, false, true);
        let factory = registry.get("Patient");
        assert_eq!(factory.name(), "GenericResourceFactory");
    }

    #[test]
    fn unsupported_resource_type_falls_back_to_generic() {
        let registry = FactoryRegistry::new(Arc::new(CodingRegistry::new()));
        let factory = registry.get("Appointment");
        assert_eq!(factory.name(), "GenericResourceFactory");
    }
}
