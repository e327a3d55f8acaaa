//! Clinical factory: Observation, DiagnosticReport, ServiceRequest,
//! Condition, AllergyIntolerance, RiskAssessment, ImagingStudy (C5).

use fhir_pipeline_models::Resource;
use serde_json::{json, Value};

use super::base::{first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use super::util::classify_by_keyword;
use crate::error::{Error, Result};

const VITAL_SIGN_LOINC: &[(&str, &str)] = &[
    ("heart rate", "8867-4"),
    ("blood pressure", "85354-9"),
    ("temperature", "8310-5"),
    ("spo2", "2708-6"),
    ("oxygen saturation", "2708-6"),
    ("weight", "29463-7"),
    ("height", "8302-2"),
    ("bmi", "39156-5"),
    ("body mass index", "39156-5"),
];

const LAB_LOINC: &[(&str, &str)] = &[
    ("glucose", "2345-7"),
    ("creatinine", "2160-0"),
    ("hba1c", "4548-4"),
    ("hemoglobin a1c", "4548-4"),
];

const DICOM_MODALITY_CODES: &[(&str, &str)] = &[
    ("ct", "CT"),
    ("mri", "MR"),
    ("x-ray", "CR"),
    ("xray", "CR"),
    ("ultrasound", "US"),
    ("pet", "PT"),
];

pub struct ClinicalFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
    reject_synthesized_series_uid: bool,
}

impl ClinicalFactory {
    pub fn new(context: FactoryContext, reject_synthesized_series_uid: bool) -> Self {
        Self { context, metrics: FactoryMetrics::default(), reject_synthesized_series_uid }
    }

    fn lookup_loinc(name: &str) -> Option<(&'static str, &'static str)> {
        let normalized: String = name.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
        VITAL_SIGN_LOINC
            .iter()
            .chain(LAB_LOINC)
            .find(|(keyword, _)| *keyword == normalized)
            .copied()
    }

    fn observation_category(name: &str) -> &'static str {
        classify_by_keyword(
            name,
            &[
                ("pressure", "vital-signs"),
                ("rate", "vital-signs"),
                ("temperature", "vital-signs"),
                ("weight", "vital-signs"),
                ("height", "vital-signs"),
                ("bmi", "vital-signs"),
                ("spo2", "vital-signs"),
                ("glucose", "laboratory"),
                ("creatinine", "laboratory"),
                ("a1c", "laboratory"),
                ("culture", "laboratory"),
                ("image", "imaging"),
                ("scan", "imaging"),
                ("procedure", "procedure"),
            ],
            "survey",
        )
    }

    fn observation_code(&self, data: &Value) -> Result<Value> {
        let name = first_alias_str(data, &["name", "code_text", "test_name"]).ok_or_else(|| Error::FactoryInput {
            resource_type: "Observation".to_string(),
            message: "name is required".to_string(),
        })?;
        if let Some((_, code)) = Self::lookup_loinc(name) {
            return self
                .context
                .coding
                .create_codeable_concept("LOINC", code, Some(name), Some(name))
                .map_err(|e| Error::FactoryInput { resource_type: "Observation".to_string(), message: e.to_string() });
        }
        Ok(json!({ "text": name }))
    }

    fn observation_value(&self, data: &Value, resource: &mut Resource) {
        if let Some(quantity) = data.get("value_quantity") {
            resource.set("valueQuantity", quantity.clone());
        } else if let Some(s) = data.get("value_string").and_then(Value::as_str) {
            resource.set("valueString", json!(s));
        } else if let Some(b) = data.get("value_boolean").and_then(Value::as_bool) {
            resource.set("valueBoolean", json!(b));
        } else if let Some(i) = data.get("value_integer").and_then(Value::as_i64) {
            resource.set("valueInteger", json!(i));
        } else if let Some(dt) = data.get("value_date_time").and_then(Value::as_str) {
            resource.set("valueDateTime", json!(dt));
        } else if let Some(concept) = data.get("value_codeable_concept") {
            resource.set("valueCodeableConcept", concept.clone());
        } else if let Some(value) = data.get("value") {
            match value {
                Value::Number(n) if n.is_i64() => resource.set("valueInteger", value.clone()),
                Value::Number(_) => resource.set("valueQuantity", json!({ "value": value })),
                Value::Bool(_) => resource.set("valueBoolean", value.clone()),
                Value::String(s) => resource.set("valueString", json!(s)),
                _ => {}
            }
        }
    }

    fn observation_components(&self, data: &Value) -> Option<Value> {
        let components = data.get("components").and_then(Value::as_array)?;
        let built: Vec<Value> = components
            .iter()
            .filter_map(|component| {
                let name = component.get("name").and_then(Value::as_str)?;
                let mut entry = json!({});
                entry["code"] = Self::lookup_loinc(name)
                    .map(|(_, code)| json!({ "coding": [{ "system": "http://loinc.org", "code": code, "display": name }] }))
                    .unwrap_or_else(|| json!({ "text": name }));
                if let Some(quantity) = component.get("value_quantity") {
                    entry["valueQuantity"] = quantity.clone();
                }
                if let Some(interpretation) = component.get("interpretation").and_then(Value::as_str) {
                    entry["interpretation"] =
                        json!([{ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation", "code": interpretation }] }]);
                }
                Some(entry)
            })
            .collect();
        if built.is_empty() {
            None
        } else {
            Some(Value::Array(built))
        }
    }

    fn diagnostic_report_category(title: &str) -> &'static str {
        classify_by_keyword(
            title,
            &[
                ("x-ray", "RAD"),
                ("ct", "RAD"),
                ("mri", "RAD"),
                ("scan", "RAD"),
                ("lab", "LAB"),
                ("blood", "LAB"),
                ("culture", "LAB"),
                ("biopsy", "PAT"),
                ("pathology", "PAT"),
                ("ecg", "CG"),
                ("ekg", "CG"),
            ],
            "OTH",
        )
    }

    fn service_request_priority(raw: Option<&str>) -> &'static str {
        match raw.unwrap_or("routine").to_lowercase().as_str() {
            "urgent" => "urgent",
            "asap" => "asap",
            "stat" | "emergency" => "stat",
            _ => "routine",
        }
    }

    fn service_request_category(title: &str) -> &'static str {
        classify_by_keyword(
            title,
            &[
                ("lab", "lab"),
                ("blood", "lab"),
                ("image", "imaging"),
                ("scan", "imaging"),
                ("x-ray", "imaging"),
                ("consult", "consultation"),
                ("surg", "surgical"),
            ],
            "diagnostic",
        )
    }

    fn allergy_category(substance: &str) -> &'static str {
        classify_by_keyword(
            substance,
            &[
                ("penicillin", "medication"),
                ("sulfa", "medication"),
                ("nsaid", "medication"),
                ("peanut", "food"),
                ("shellfish", "food"),
                ("egg", "food"),
                ("milk", "food"),
                ("latex", "biologic"),
                ("pollen", "environment"),
                ("dust", "environment"),
            ],
            "medication",
        )
    }

    fn imaging_series(&self, data: &Value, resource_type: &str) -> Result<Value> {
        let series_input = data.get("series").and_then(Value::as_array).filter(|s| !s.is_empty()).ok_or_else(|| {
            Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: "at least one series with uid and modality is required".to_string(),
            }
        })?;

        let mut series = Vec::new();
        for entry in series_input {
            let modality = entry.get("modality").and_then(Value::as_str).unwrap_or("OT");
            let dicom_code = DICOM_MODALITY_CODES
                .iter()
                .find(|(keyword, _)| *keyword == modality.to_lowercase())
                .map(|(_, code)| *code)
                .unwrap_or(modality);

            let uid = match entry.get("uid").and_then(Value::as_str) {
                Some(uid) => uid.to_string(),
                None if self.reject_synthesized_series_uid => {
                    return Err(Error::FactoryInput {
                        resource_type: resource_type.to_string(),
                        message: "series uid is required and synthesized UIDs are rejected by configuration"
                            .to_string(),
                    });
                }
                None => format!("2.25.{}", uuid::Uuid::new_v4().as_u128()),
            };

            let instance_count = entry.get("numberOfInstances").and_then(Value::as_u64).unwrap_or(1);
            series.push(json!({
                "uid": uid,
                "modality": { "system": "http://dicom.nema.org/resources/ontology/DCM", "code": dicom_code },
                "numberOfInstances": instance_count
            }));
        }
        Ok(Value::Array(series))
    }
}

impl ResourceFactory for ClinicalFactory {
    fn name(&self) -> &'static str {
        "ClinicalResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, resource_type: &str) -> bool {
        matches!(
            resource_type,
            "Observation"
                | "DiagnosticReport"
                | "ServiceRequest"
                | "Condition"
                | "AllergyIntolerance"
                | "RiskAssessment"
                | "ImagingStudy"
        )
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        let mut resource = Resource::new(resource_type);

        let subject_field = if resource_type == "AllergyIntolerance" { "patient" } else { "subject" };
        if let Some(subject) = first_alias_str(data, &["patient_id", "patient_ref", "subject"]) {
            resource.set(subject_field, self.reference_value(subject, "Patient"));
        }

        match resource_type {
            "Observation" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("final")));
                let name = first_alias_str(data, &["name", "code_text", "test_name"]).unwrap_or_default();
                resource.set(
                    "category",
                    json!([{ "coding": [{
                        "system": "http://terminology.hl7.org/CodeSystem/observation-category",
                        "code": Self::observation_category(name)
                    }] }]),
                );
                resource.set("code", self.observation_code(data)?);
                self.observation_value(data, &mut resource);
                if let Some(components) = self.observation_components(data) {
                    resource.set("component", components);
                }
            }
            "DiagnosticReport" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("final")));
                let title = first_alias_str(data, &["title", "name"]).unwrap_or_default();
                resource.set("code", json!({ "text": title }));
                resource.set(
                    "category",
                    json!([{ "coding": [{
                        "system": "http://terminology.hl7.org/CodeSystem/v2-0074",
                        "code": Self::diagnostic_report_category(title)
                    }] }]),
                );
            }
            "ServiceRequest" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("active")));
                resource.set("intent", json!(data.get("intent").and_then(Value::as_str).unwrap_or("order")));
                let title = first_alias_str(data, &["title", "name", "code_text"]).unwrap_or_default();
                resource.set("code", json!({ "text": title }));
                resource.set("priority", json!(Self::service_request_priority(data.get("priority").and_then(Value::as_str))));
                resource.set(
                    "category",
                    json!([{ "coding": [{
                        "system": "http://snomed.info/sct",
                        "code": "0",
                        "display": Self::service_request_category(title)
                    }] }]),
                );
            }
            "Condition" => {
                let name = first_alias_str(data, &["name", "code_text", "condition"]).unwrap_or_default();
                resource.set("code", json!({ "text": name }));
                let clinical = data.get("clinical_status").and_then(Value::as_str).unwrap_or("active");
                resource.set(
                    "clinicalStatus",
                    json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/condition-clinical", "code": clinical }] }),
                );
                let verification = data.get("verification_status").and_then(Value::as_str).unwrap_or("confirmed");
                resource.set(
                    "verificationStatus",
                    json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/condition-ver-status", "code": verification }] }),
                );
            }
            "AllergyIntolerance" => {
                let substance = first_alias_str(data, &["substance", "name", "allergen"]).unwrap_or_default();
                resource.set("code", json!({ "text": substance }));
                resource.set("category", json!([Self::allergy_category(substance)]));
                let criticality = data.get("criticality").and_then(Value::as_str).unwrap_or("low");
                resource.set("criticality", json!(criticality));
                if let Some(manifestations) = data.get("manifestations").and_then(Value::as_array) {
                    let reactions: Vec<Value> = manifestations
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|m| json!({ "manifestation": [{ "text": m }] }))
                        .collect();
                    if !reactions.is_empty() {
                        resource.set("reaction", Value::Array(reactions));
                    }
                }
            }
            "RiskAssessment" => {
                resource.set("status", json!("final"));
                let outcome = first_alias_str(data, &["outcome", "name"]).unwrap_or_default();
                let mut prediction = json!({ "outcome": { "text": outcome } });
                if let Some(probability) = data.get("probability").and_then(Value::as_f64) {
                    prediction["probabilityDecimal"] = json!(probability);
                } else if let Some(qualitative) = data.get("risk_level").and_then(Value::as_str) {
                    let code = match qualitative.to_lowercase().as_str() {
                        "high" => "high",
                        "moderate" | "medium" => "moderate",
                        _ => "low",
                    };
                    prediction["qualitativeRisk"] =
                        json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/risk-probability", "code": code }] });
                }
                resource.set("prediction", json!([prediction]));
            }
            "ImagingStudy" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("available")));
                let series = self.imaging_series(data, resource_type)?;
                let series_count = series.as_array().map(|s| s.len()).unwrap_or(0) as u64;
                let instance_count = series
                    .as_array()
                    .map(|s| s.iter().filter_map(|e| e.get("numberOfInstances").and_then(Value::as_u64)).sum())
                    .unwrap_or(0u64);
                resource.set("series", series);
                resource.set("numberOfSeries", json!(series_count));
                resource.set("numberOfInstances", json!(instance_count));
            }
            _ => {}
        }

        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn context() -> FactoryContext {
        FactoryContext {
            coding: Arc::new(fhir_pipeline_coding::CodingRegistry::new()),
            validators: Arc::new(fhir_pipeline_validator::ValidatorRegistry::new()),
            references: Arc::new(fhir_pipeline_reference::ReferenceManager::new()),
        }
    }

    #[test]
    fn looks_up_vital_sign_loinc_code() {
        let factory = ClinicalFactory::new(context(), false);
        let data = json!({ "subject": "Patient/p1", "name": "Heart Rate", "status": "final", "value": 72 });
        let resource = factory.create("Observation", &data, None).unwrap();
        assert_eq!(resource.get("code").unwrap()["coding"][0]["code"], "8867-4");
        assert_eq!(resource.get("category").unwrap()[0]["coding"][0]["code"], "vital-signs");
        assert_eq!(resource.get("valueInteger").unwrap(), 72);
    }

    #[test]
    fn imaging_study_auto_mints_series_uid_by_default() {
        let factory = ClinicalFactory::new(context(), false);
        let data = json!({ "subject": "Patient/p1", "series": [{ "modality": "ct" }] });
        let resource = factory.create("ImagingStudy", &data, None).unwrap();
        assert_eq!(resource.get("numberOfSeries").unwrap(), 1);
        assert!(resource.get("series").unwrap()[0]["uid"].as_str().unwrap().starts_with("2.25."));
    }

    #[test]
    fn imaging_study_rejects_missing_uid_when_configured() {
        let factory = ClinicalFactory::new(context(), true);
        let data = json!({ "subject": "Patient/p1", "series": [{ "modality": "ct" }] });
        assert!(factory.create("ImagingStudy", &data, None).is_err());
    }
}
