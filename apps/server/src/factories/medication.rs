//! Medication family factory: MedicationRequest, MedicationAdministration,
//! Medication, MedicationDispense, MedicationStatement (C5).

use fhir_pipeline_models::Resource;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;

use super::base::{first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use crate::error::{Error, Result};

const ROUTE_CODES: &[(&str, &str)] = &[
    ("oral", "26643006"),
    ("iv", "47625008"),
    ("intravenous", "47625008"),
    ("im", "78421000"),
    ("intramuscular", "78421000"),
    ("subcutaneous", "34206005"),
    ("topical", "45890007"),
    ("inhalation", "447694001"),
];

const FREQUENCY_TABLE: &[(&str, (u32, u32, &str))] = &[
    ("once daily", (1, 1, "d")),
    ("daily", (1, 1, "d")),
    ("twice daily", (2, 1, "d")),
    ("bid", (2, 1, "d")),
    ("three times daily", (3, 1, "d")),
    ("tid", (3, 1, "d")),
    ("four times daily", (4, 1, "d")),
    ("qid", (4, 1, "d")),
    ("every 6 hours", (1, 6, "h")),
    ("every 8 hours", (1, 8, "h")),
    ("every 12 hours", (1, 12, "h")),
    ("as needed", (0, 0, "")),
];

/// Substring + drug-class cross-reactivity table for the allergy safety
/// check. Each entry is (allergen keyword, [cross-reactive class keywords]).
const CROSS_REACTIVITY: &[(&str, &[&str])] = &[
    ("penicillin", &["amoxicillin", "ampicillin", "cephalexin", "cefazolin"]),
    ("sulfa", &["sulfamethoxazole", "sulfasalazine"]),
    ("nsaid", &["ibuprofen", "naproxen", "aspirin", "ketorolac"]),
];

pub struct MedicationFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
    safety_validation_enabled: bool,
}

impl MedicationFactory {
    pub fn new(context: FactoryContext, safety_validation_enabled: bool) -> Self {
        Self { context, metrics: FactoryMetrics::default(), safety_validation_enabled }
    }

    fn medication_concept(&self, data: &Value) -> Result<Value> {
        let name = first_alias_str(data, &["medication_name", "medication"]).ok_or_else(|| {
            Error::FactoryInput {
                resource_type: "Medication".to_string(),
                message: "medication_name is required".to_string(),
            }
        })?;

        if let Some(rxnorm) = data.get("rxnorm_code").and_then(Value::as_str) {
            return self
                .context
                .coding
                .create_codeable_concept("RXNORM", rxnorm, Some(name), Some(name))
                .map_err(|e| factory_error(e, "Medication"));
        }
        if let Some(ndc) = data.get("ndc_code").and_then(Value::as_str) {
            return self
                .context
                .coding
                .create_codeable_concept("NDC", ndc, Some(name), Some(name))
                .map_err(|e| factory_error(e, "Medication"));
        }
        Ok(json!({ "text": name }))
    }

    fn dosage_instruction(&self, data: &Value) -> Option<Value> {
        let dosage = data.get("dosage")?;
        if let Some(text) = dosage.as_str() {
            return Some(self.parse_dosage_text(text));
        }
        if let Some(obj) = dosage.as_object() {
            let mut entry = json!({});
            if let Some(route) = obj.get("route").and_then(Value::as_str) {
                entry["route"] = self.route_concept(route);
            }
            if let Some(amount) = obj.get("amount").and_then(Value::as_str) {
                if let Some(quantity) = parse_dose_quantity(amount) {
                    entry["doseAndRate"] = json!([{ "doseQuantity": quantity }]);
                }
            }
            if let Some(frequency) = obj.get("frequency").and_then(Value::as_str) {
                if let Some(timing) = frequency_timing(frequency) {
                    entry["timing"] = timing;
                }
            }
            return Some(entry);
        }
        None
    }

    fn parse_dosage_text(&self, text: &str) -> Value {
        let mut entry = json!({ "text": text });
        let lower = text.to_lowercase();
        for (keyword, code) in ROUTE_CODES {
            if lower.contains(keyword) {
                entry["route"] = self.route_concept(keyword);
                break;
            }
        }
        if let Some(timing) = FREQUENCY_TABLE
            .iter()
            .find(|(keyword, _)| lower.contains(keyword))
            .and_then(|(keyword, _)| frequency_timing(keyword))
        {
            entry["timing"] = timing;
        }
        if let Some(quantity) = parse_dose_quantity(text) {
            entry["doseAndRate"] = json!([{ "doseQuantity": quantity }]);
        }
        entry
    }

    fn route_concept(&self, route: &str) -> Value {
        let lower = route.to_lowercase();
        if let Some((_, code)) = ROUTE_CODES.iter().find(|(keyword, _)| lower.contains(keyword)) {
            return json!({ "coding": [{
                "system": "http://snomed.info/sct",
                "code": code,
                "display": route
            }] });
        }
        json!({ "text": route })
    }

    /// Direct substring match plus drug-class cross-reactivity against a
    /// patient's known allergies; returns the matched allergen label.
    fn check_allergy_conflicts(&self, medication_name: &str, allergies: &[Value]) -> Vec<String> {
        let medication_lower = medication_name.to_lowercase();
        let mut hits = Vec::new();
        for allergy in allergies {
            let Some(allergy_name) = allergy.as_str() else { continue };
            let allergy_lower = allergy_name.to_lowercase();
            if medication_lower.contains(&allergy_lower) {
                hits.push(allergy_name.to_string());
                continue;
            }
            for (allergen, cross_reactive) in CROSS_REACTIVITY {
                if allergy_lower.contains(allergen)
                    && cross_reactive.iter().any(|drug| medication_lower.contains(drug))
                {
                    hits.push(allergy_name.to_string());
                }
            }
        }
        hits
    }
}

fn factory_error(e: fhir_pipeline_coding::CodingError, resource_type: &str) -> Error {
    Error::FactoryInput { resource_type: resource_type.to_string(), message: e.to_string() }
}

fn frequency_timing(keyword: &str) -> Option<Value> {
    let (_, (frequency, period, period_unit)) =
        FREQUENCY_TABLE.iter().find(|(k, _)| *k == keyword)?;
    if *frequency == 0 {
        return Some(json!({ "repeat": { "boundsDuration": { "value": 1, "unit": "d" } } }));
    }
    Some(json!({ "repeat": { "frequency": frequency, "period": period, "periodUnit": period_unit } }))
}

fn parse_dose_quantity(text: &str) -> Option<Value> {
    let mut iter = text.split_whitespace();
    let value_token = iter.next()?;
    let value = Decimal::from_str(value_token).ok()?;
    let unit = iter.next().unwrap_or("mg");
    Some(json!({ "value": value, "unit": unit, "system": "http://unitsofmeasure.org", "code": unit }))
}

impl ResourceFactory for MedicationFactory {
    fn name(&self) -> &'static str {
        "MedicationResourceFactory"
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
            "MedicationRequest" | "MedicationAdministration" | "Medication" | "MedicationDispense" | "MedicationStatement"
        )
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        let mut resource = Resource::new(resource_type);

        if resource_type == "Medication" {
            resource.set("code", self.medication_concept(data)?);
            return Ok(resource);
        }

        let concept = self.medication_concept(data)?;
        resource.set("medicationCodeableConcept", concept.clone());

        let subject = first_alias_str(data, &["patient_id", "patient_ref", "subject"]).ok_or_else(|| {
            Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: "subject/patient_id is required".to_string(),
            }
        })?;
        let subject_field = if resource_type == "AllergyIntolerance" { "patient" } else { "subject" };
        resource.set(subject_field, self.reference_value(subject, "Patient"));

        let default_status = match resource_type {
            "MedicationRequest" => "active",
            "MedicationAdministration" | "MedicationDispense" => "completed",
            "MedicationStatement" => "active",
            _ => "active",
        };
        let status = data.get("status").and_then(Value::as_str).unwrap_or(default_status);
        resource.set("status", json!(status));

        if resource_type == "MedicationRequest" {
            resource.set("intent", json!(data.get("intent").and_then(Value::as_str).unwrap_or("order")));

            if let Some(dosage) = self.dosage_instruction(data) {
                resource.set("dosageInstruction", json!([dosage]));
            }

            if self.safety_validation_enabled {
            if let Some(allergies) = data.get("patient_allergies").and_then(Value::as_array) {
                let medication_name = first_alias_str(data, &["medication_name", "medication"]).unwrap_or_default();
                let hits = self.check_allergy_conflicts(medication_name, allergies);
                if !hits.is_empty() {
                    let note_text = format!("SAFETY ALERT: potential interaction with {}", hits.join(", "));
                    resource.set("note", json!([{ "text": note_text }]));
                    tracing::warn!(medication = medication_name, allergies = ?hits, "medication allergy conflict detected");
                }
            }
            }
        }

        if resource_type == "MedicationAdministration" {
            if let Some(dosage) = self.dosage_instruction(data) {
                resource.set("dosage", dosage);
            }
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
    fn builds_medication_request_with_text_only_concept() {
        let factory = MedicationFactory::new(context(), true);
        let data = json!({ "medication_name": "Acetaminophen", "subject": "Patient/p1" });
        let resource = factory.create("MedicationRequest", &data, None).unwrap();
        assert_eq!(resource.get("status").unwrap(), "active");
        assert_eq!(resource.get("intent").unwrap(), "order");
        assert_eq!(resource.get("medicationCodeableConcept").unwrap()["text"], "Acetaminophen");
    }

    #[test]
    fn flags_penicillin_cross_reactivity() {
        let factory = MedicationFactory::new(context(), true);
        let data = json!({
            "medication_name": "Amoxicillin",
            "subject": "Patient/p1",
            "patient_allergies": ["Penicillin"]
        });
        let resource = factory.create("MedicationRequest", &data, None).unwrap();
        let note_text = resource.get("note").unwrap()[0]["text"].as_str().unwrap();
        assert!(note_text.starts_with("SAFETY ALERT"));
        assert!(note_text.contains("Penicillin"));
    }

    #[test]
    fn safety_validation_disabled_skips_allergy_check() {
        let factory = MedicationFactory::new(context(), false);
        let data = json!({
            "medication_name": "Amoxicillin",
            "subject": "Patient/p1",
            "patient_allergies": ["Penicillin"]
        });
        let resource = factory.create("MedicationRequest", &data, None).unwrap();
        assert!(resource.get("note").is_none());
    }

    #[test]
    fn parses_dose_quantity_from_free_text() {
        let factory = MedicationFactory::new(context(), true);
        let data = json!({ "medication_name": "Ibuprofen", "subject": "Patient/p1", "dosage": "10 mg orally twice daily" });
        let resource = factory.create("MedicationRequest", &data, None).unwrap();
        let dosage = &resource.get("dosageInstruction").unwrap()[0];
        assert_eq!(dosage["doseAndRate"][0]["doseQuantity"]["value"], "10");
    }
}
