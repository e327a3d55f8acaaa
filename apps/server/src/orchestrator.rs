//! Unified Orchestrator (C13): drives entity-to-bundle assembly, optional
//! validation and execution, and the summary-prep/quality-metrics views
//! downstream collaborators consume.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fhir_pipeline_models::{ProcessingResult, ProcessingStage, Resource};
use fhir_pipeline_validator::ValidatorRegistry;
use serde_json::{json, Value};

use crate::bundle::{assembler::BundleAssembler, optimizer::QualityOptimizer};
use crate::config::Config;
use crate::failover::FailoverManager;
use crate::fhir_client::FhirClient;
use crate::perf::PerformanceManager;
use crate::registry::FactoryRegistry;

const SOFT_SLA: Duration = Duration::from_secs(2);
const HARD_CEILING: Duration = Duration::from_secs(30);

pub struct Orchestrator {
    factory_registry: Arc<FactoryRegistry>,
    validator_registry: Arc<ValidatorRegistry>,
    quality_optimizer: Arc<QualityOptimizer>,
    performance_manager: Arc<PerformanceManager>,
    failover_manager: Arc<FailoverManager>,
    fhir_client: Arc<FhirClient>,
    #[allow(dead_code)]
    config: Arc<Config>,
    assembler: BundleAssembler,
}

impl Orchestrator {
    pub fn new(
        factory_registry: Arc<FactoryRegistry>,
        validator_registry: Arc<ValidatorRegistry>,
        quality_optimizer: Arc<QualityOptimizer>,
        performance_manager: Arc<PerformanceManager>,
        failover_manager: Arc<FailoverManager>,
        fhir_client: Arc<FhirClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            factory_registry,
            validator_registry,
            quality_optimizer,
            performance_manager,
            failover_manager,
            fhir_client,
            config,
            assembler: BundleAssembler::new(),
        }
    }

    pub async fn process(
        &self,
        entities: Value,
        validate_bundle: bool,
        execute_bundle: bool,
        request_id: Option<String>,
    ) -> ProcessingResult {
        let request_id = request_id.unwrap_or_else(|| format!("req-{}", uuid::Uuid::new_v4()));
        let started_at = Instant::now();
        let mut result = ProcessingResult::new(request_id.clone(), entities.clone());

        // Step 2: resource creation, in the fixed order Patient -> conditions
        // -> medications -> procedures/observations.
        let step_start = Instant::now();
        let (resources, patient_reference, mut errors) = self.create_resources(&entities, &request_id);
        result.processing_metadata.processing_steps.push("resource_creation".to_string());
        result
            .processing_metadata
            .performance_metrics
            .insert("resource_creation_time".to_string(), step_start.elapsed().as_secs_f64());

        if resources.is_empty() {
            errors.push("no resources were created from the supplied entities".to_string());
            result.errors = errors;
            result.processing_metadata.error_count = result.errors.len();
            result.total_duration = started_at.elapsed();
            result.sla_violated = result.total_duration > SOFT_SLA;
            result.failed_stage = Some(ProcessingStage::ResourceCreation);
            return result;
        }

        result.fhir_resources = resources.iter().map(|r| r.clone().into_value()).collect();

        // Step 3: bundle assembly (includes the quality optimizer pre-pass).
        let step_start = Instant::now();
        let bundle = self.assembler.assemble(resources, Some(&request_id));
        let bundle_value = serde_json::to_value(&bundle).unwrap_or(Value::Null);
        let optimized_bundle = self.quality_optimizer.optimize_bundle(&bundle_value, Some(&request_id));
        result.processing_metadata.processing_steps.push("bundle_assembly".to_string());
        result
            .processing_metadata
            .performance_metrics
            .insert("bundle_assembly_time".to_string(), step_start.elapsed().as_secs_f64());
        result.bundle = Some(optimized_bundle.clone());

        // Step 4: validation.
        let mut validation_result = None;
        if validate_bundle {
            let step_start = Instant::now();
            let outcome = self
                .fhir_client
                .validate_bundle(
                    &optimized_bundle,
                    Some(&request_id),
                    &self.validator_registry,
                    &self.performance_manager,
                    &self.failover_manager,
                )
                .await;
            self.quality_optimizer.analyze_validation_result(&outcome, &optimized_bundle, Some(&request_id));
            result
                .processing_metadata
                .performance_metrics
                .insert("validation_time".to_string(), step_start.elapsed().as_secs_f64());
            result.processing_metadata.processing_steps.push("validation".to_string());
            if !outcome.valid {
                errors.extend(outcome.errors());
            }
            result.warnings.extend(outcome.warnings());
            result.validation = Some(outcome.clone());
            validation_result = Some(outcome);
        }

        // Step 5: execution, only if requested and validation (when run) passed.
        let should_execute = execute_bundle && validation_result.as_ref().map(|v| v.valid).unwrap_or(true);
        if execute_bundle && !should_execute {
            errors.push("execution skipped: validation did not pass".to_string());
        }
        if should_execute {
            let step_start = Instant::now();
            let (outcome, _) = self
                .fhir_client
                .execute_bundle(
                    &optimized_bundle,
                    Some(&request_id),
                    false,
                    false,
                    &self.validator_registry,
                    &self.performance_manager,
                    &self.failover_manager,
                )
                .await;
            result
                .processing_metadata
                .performance_metrics
                .insert("execution_time".to_string(), step_start.elapsed().as_secs_f64());
            result.processing_metadata.processing_steps.push("execution".to_string());
            if !outcome.executed {
                if let Some(reason) = &outcome.refused_reason {
                    errors.push(reason.clone());
                }
            }
            result.execution_response = serde_json::to_value(&outcome).ok();
        }

        // Step 6: summary-prep and quality metrics.
        let step_start = Instant::now();
        result.summary_prep = build_summary_prep(&entities, &optimized_bundle, &patient_reference, validation_result.as_ref());
        result.quality_metrics = self.quality_metrics(validation_result.as_ref());
        result.processing_metadata.processing_steps.push("summary_prep".to_string());
        result
            .processing_metadata
            .performance_metrics
            .insert("summary_prep_time".to_string(), step_start.elapsed().as_secs_f64());

        result.errors = errors;
        result.processing_metadata.error_count = result.errors.len();
        result.processing_metadata.warning_count = result.warnings.len();
        result.total_duration = started_at.elapsed();
        result.sla_violated = result.total_duration > SOFT_SLA;
        if result.total_duration > HARD_CEILING {
            tracing::error!(request_id, elapsed_s = result.total_duration.as_secs_f64(), "hard processing ceiling exceeded");
        }

        result.success = !resources_is_empty(&result.fhir_resources) && result.bundle.is_some() && result.errors.is_empty();
        result
    }

    fn create_resources(&self, entities: &Value, request_id: &str) -> (Vec<Resource>, Option<String>, Vec<String>) {
        self.factory_registry.references().clear();
        let mut resources = Vec::new();
        let mut errors = Vec::new();
        let mut patient_reference = None;
        let mut known_allergies = None;

        if let Some(patient_info) = entities.get("patient_info") {
            known_allergies = patient_info.get("known_allergies").cloned();
            match self.factory_registry.get("Patient").create("Patient", patient_info, Some(request_id)) {
                Ok(patient) => {
                    patient_reference = patient.reference();
                    resources.push(patient);
                }
                Err(err) => errors.push(format!("patient: {err}")),
            }
        }

        if let Some(conditions) = entities.get("conditions").and_then(Value::as_array) {
            for condition in conditions {
                let data = with_subject(condition, patient_reference.as_deref());
                match self.factory_registry.get("Condition").create("Condition", &data, Some(request_id)) {
                    Ok(resource) => resources.push(resource),
                    Err(err) => errors.push(format!("condition: {err}")),
                }
            }
        }

        if let Some(medications) = entities.get("medications").and_then(Value::as_array) {
            for medication in medications {
                let mut data = with_subject(medication, patient_reference.as_deref());
                if let (Some(allergies), Value::Object(map)) = (&known_allergies, &mut data) {
                    map.entry("patient_allergies".to_string()).or_insert_with(|| allergies.clone());
                }
                match self.factory_registry.get("MedicationRequest").create("MedicationRequest", &data, Some(request_id)) {
                    Ok(resource) => resources.push(resource),
                    Err(err) => errors.push(format!("medication: {err}")),
                }
            }
        }

        if let Some(procedures) = entities.get("procedures").and_then(Value::as_array) {
            for procedure in procedures {
                let data = with_subject(procedure, patient_reference.as_deref());
                match self.factory_registry.get("ServiceRequest").create("ServiceRequest", &data, Some(request_id)) {
                    Ok(resource) => resources.push(resource),
                    Err(err) => errors.push(format!("procedure: {err}")),
                }
            }
        }

        if let Some(observations) = entities.get("observations").and_then(Value::as_array) {
            for observation in observations {
                let data = with_subject(observation, patient_reference.as_deref());
                match self.factory_registry.get("Observation").create("Observation", &data, Some(request_id)) {
                    Ok(resource) => resources.push(resource),
                    Err(err) => errors.push(format!("observation: {err}")),
                }
            }
        }

        (resources, patient_reference, errors)
    }

    fn quality_metrics(&self, validation: Option<&fhir_pipeline_models::ValidationResult>) -> Value {
        let success_rate = self.quality_optimizer.get_validation_success_rate();
        let average_quality = validation.map(|v| v.bundle_quality_score).unwrap_or(0.0);
        json!({
            "validation_success_rate": success_rate,
            "validation_success_target_met": success_rate >= 95.0,
            "average_bundle_quality": average_quality,
            "bundle_quality_target_met": average_quality >= 0.95,
        })
    }
}

/// Merges a `patient_id`/`patient_ref` field pointing at the root patient
/// reference into an entity's data object, without clobbering a reference
/// the entity already carries.
fn with_subject(entity: &Value, patient_reference: Option<&str>) -> Value {
    let mut data = entity.clone();
    if let (Some(reference), Value::Object(map)) = (patient_reference, &mut data) {
        map.entry("patient_id".to_string()).or_insert_with(|| json!(reference));
    }
    data
}

fn resources_is_empty(resources: &[Value]) -> bool {
    resources.is_empty()
}

fn build_summary_prep(
    entities: &Value,
    bundle: &Value,
    patient_reference: &Option<String>,
    validation: Option<&fhir_pipeline_models::ValidationResult>,
) -> Value {
    let patient_info = entities.get("patient_info").cloned().unwrap_or(Value::Null);
    let entry_count = bundle.get("entry").and_then(Value::as_array).map(|e| e.len()).unwrap_or(0);

    json!({
        "patient_summary": {
            "age": patient_info.get("age").cloned().unwrap_or(Value::Null),
            "gender": patient_info.get("gender").cloned().unwrap_or(Value::Null),
            "patient_reference": patient_reference,
        },
        "medications": entities.get("medications").cloned().unwrap_or(json!([])),
        "conditions": entities.get("conditions").cloned().unwrap_or(json!([])),
        "procedures": entities.get("procedures").cloned().unwrap_or(json!([])),
        "bundle_metadata": {
            "bundle_id": bundle.get("id").cloned().unwrap_or(Value::Null),
            "bundle_type": bundle.get("type").cloned().unwrap_or(Value::Null),
            "entry_count": entry_count,
            "timestamp": bundle.get("timestamp").cloned().unwrap_or(Value::Null),
        },
        "quality_indicators": {
            "validation_result": validation.map(|v| v.validation_result.clone()).unwrap_or_else(|| "not_run".to_string()),
            "bundle_quality_score": validation.map(|v| v.bundle_quality_score).unwrap_or(0.0),
            "validation_source": validation.map(|v| v.validation_source),
            "has_errors": validation.map(|v| v.error_count() > 0).unwrap_or(false),
            "has_warnings": validation.map(|v| !v.warnings().is_empty()).unwrap_or(false),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir_pipeline_coding::CodingRegistry;
    use crate::registry::FeatureFlags;

    fn orchestrator() -> Orchestrator {
        let coding = Arc::new(CodingRegistry::new());
        let validators = Arc::new(ValidatorRegistry::new());
        let factory_registry = Arc::new(FactoryRegistry::with_flags(coding, FeatureFlags::default(), false, true));
        let quality_optimizer = Arc::new(QualityOptimizer::new(validators.clone()));
        let performance_manager = Arc::new(PerformanceManager::new(100, Duration::from_secs(3600)));
        let failover_manager = Arc::new(FailoverManager::from_config(&Config::default().fhir));
        let fhir_client = Arc::new(FhirClient::new(&Config::default()).unwrap());
        Orchestrator::new(
            factory_registry,
            validators,
            quality_optimizer,
            performance_manager,
            failover_manager,
            fhir_client,
            Arc::new(Config::default()),
        )
    }

    #[tokio::test]
    async fn process_without_validation_builds_bundle_from_entities() {
        let orchestrator = orchestrator();
        let entities = json!({
            "patient_info": { "age": 45, "gender": "female" },
            "conditions": [{ "name": "hypertension" }],
            "medications": [{ "name": "lisinopril", "dosage": "10mg" }],
        });
        let result = orchestrator.process(entities, false, false, None).await;
        assert!(result.success, "{:?}", result.errors);
        assert!(result.bundle.is_some());
        assert_eq!(result.fhir_resources.len(), 3);
    }

    #[tokio::test]
    async fn process_with_no_entities_fails() {
        let orchestrator = orchestrator();
        let result = orchestrator.process(json!({}), false, false, None).await;
        assert!(!result.success);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn known_allergies_propagate_to_medication_safety_check() {
        let orchestrator = orchestrator();
        let entities = json!({
            "patient_info": { "age": 45, "gender": "female", "known_allergies": ["Penicillin"] },
            "medications": [{ "medication_name": "Amoxicillin", "dosage": "500mg" }],
        });
        let result = orchestrator.process(entities, false, false, None).await;
        assert!(result.success, "{:?}", result.errors);
        let medication = result
            .fhir_resources
            .iter()
            .find(|r| r.get("resourceType").and_then(Value::as_str) == Some("MedicationRequest"))
            .expect("medication request resource present");
        let note_text = medication
            .get("note")
            .and_then(Value::as_array)
            .and_then(|notes| notes.first())
            .and_then(|n| n.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        assert!(note_text.contains("SAFETY ALERT"), "expected a safety alert note, got: {note_text:?}");
    }

    #[tokio::test]
    async fn summary_prep_reflects_patient_reference() {
        let orchestrator = orchestrator();
        let entities = json!({ "patient_info": { "age": 30, "gender": "male" } });
        let result = orchestrator.process(entities, false, false, None).await;
        assert!(result.summary_prep["patient_summary"]["patient_reference"].is_string());
    }
}
