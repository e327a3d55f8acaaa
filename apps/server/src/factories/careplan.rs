//! CarePlan factory (C5).

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use fhir_pipeline_models::Resource;
use serde_json::{json, Value};

use super::base::{first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use super::util::classify_by_keyword;
use crate::error::{Error, Result};

const STATUSES: &[&str] =
    &["draft", "active", "on-hold", "revoked", "completed", "entered-in-error", "unknown"];
const INTENTS: &[&str] = &["proposal", "plan", "order", "option", "directive"];

const CATEGORY_TABLE: &[(&str, &str, &str)] = &[
    ("assess", "386053000", "Evaluation procedure"),
    ("evaluat", "386053000", "Evaluation procedure"),
    ("screen", "386053000", "Evaluation procedure"),
    ("therap", "386056008", "Therapeutic procedure"),
    ("treatment", "386056008", "Therapeutic procedure"),
    ("rehabilitation", "386056008", "Therapeutic procedure"),
    ("educat", "311401005", "Patient education"),
    ("teach", "311401005", "Patient education"),
    ("instruct", "311401005", "Patient education"),
    ("medicat", "385798007", "Medication therapy management"),
    ("drug", "385798007", "Medication therapy management"),
    ("prescription", "385798007", "Medication therapy management"),
    ("diet", "226078001", "Dietary management"),
    ("nutrition", "226078001", "Dietary management"),
    ("meal", "226078001", "Dietary management"),
    ("exercis", "226029000", "Physical activity plan"),
    ("physical", "226029000", "Physical activity plan"),
    ("activity", "226029000", "Physical activity plan"),
    ("discharge", "736366004", "Discharge planning"),
    ("transition", "736366004", "Discharge planning"),
];

/// Maps an `activities[*].kind` input value to the FHIR resource type name
/// referenced by `activity.detail.kind`.
fn activity_kind_resource_type(kind: &str) -> &'static str {
    match kind.to_lowercase().as_str() {
        "appointment" => "Appointment",
        "communication" => "CommunicationRequest",
        "device" => "DeviceRequest",
        "medication" => "MedicationRequest",
        "nutrition" => "NutritionOrder",
        "task" => "Task",
        "procedure" | "observation" | "diagnostic" => "ServiceRequest",
        "supply" => "SupplyRequest",
        "vision" => "VisionPrescription",
        other => {
            tracing::debug!(kind = other, "unrecognized CarePlan activity kind, leaving unset");
            "ServiceRequest"
        }
    }
}

pub struct CarePlanFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
}

impl CarePlanFactory {
    pub fn new(context: FactoryContext) -> Self {
        Self { context, metrics: FactoryMetrics::default() }
    }

    fn category(&self, data: &Value) -> Value {
        if let Some(explicit) = data.get("category").and_then(Value::as_str) {
            let key = explicit.to_lowercase();
            for (keyword, code, display) in CATEGORY_TABLE {
                if key == *keyword {
                    return self.snomed_concept(code, display);
                }
            }
            return json!({ "text": explicit });
        }
        let haystack = format!(
            "{} {}",
            data.get("title").and_then(Value::as_str).unwrap_or_default(),
            data.get("description").and_then(Value::as_str).unwrap_or_default(),
        );
        let (code, display) = CATEGORY_TABLE
            .iter()
            .find(|(keyword, _, _)| haystack.to_lowercase().contains(keyword))
            .map(|(_, code, display)| (*code, *display))
            .unwrap_or(("386053000", "Evaluation procedure"));
        self.snomed_concept(code, display)
    }

    fn snomed_concept(&self, code: &str, display: &str) -> Value {
        self.context
            .coding
            .create_codeable_concept("SNOMED", code, Some(display), None)
            .unwrap_or_else(|_| json!({ "text": display }))
    }

    fn period(&self, data: &Value) -> Option<Value> {
        let mut period = serde_json::Map::new();
        let start = first_alias_str(data, &["period_start", "start_date"]).map(str::to_string);
        if let Some(start) = &start {
            period.insert("start".to_string(), json!(start));
        }
        if let Some(end) = first_alias_str(data, &["period_end", "end_date"]) {
            period.insert("end".to_string(), json!(end));
        } else if let (Some(start), Some(days)) =
            (&start, data.get("duration_days").and_then(Value::as_i64))
        {
            if let Ok(start_date) = NaiveDate::parse_from_str(&start[..10.min(start.len())], "%Y-%m-%d") {
                let end_date = start_date + ChronoDuration::days(days);
                period.insert("end".to_string(), json!(end_date.format("%Y-%m-%d").to_string()));
            }
        }
        if period.is_empty() {
            None
        } else {
            Some(Value::Object(period))
        }
    }

    fn goals(&self, data: &Value) -> Option<Value> {
        let raw = data.get("goals")?;
        let items: Vec<&Value> = match raw {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let goals: Vec<Value> = items
            .into_iter()
            .filter_map(|goal| match goal {
                Value::String(s) => Some(self.reference_value(s, "Goal")),
                Value::Object(map) => {
                    let id = map.get("id").and_then(Value::as_str).unwrap_or("unknown");
                    let mut entry = self.reference_value(id, "Goal");
                    if let Some(display) =
                        map.get("display").or_else(|| map.get("description")).and_then(Value::as_str)
                    {
                        entry["display"] = json!(display);
                    }
                    Some(entry)
                }
                _ => None,
            })
            .collect();
        (!goals.is_empty()).then_some(Value::Array(goals))
    }

    fn activities(&self, data: &Value) -> Option<Value> {
        let raw = data.get("activities")?;
        let items: Vec<&Value> = match raw {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let built: Vec<Value> = items
            .into_iter()
            .map(|activity| match activity {
                Value::String(text) => {
                    json!({ "detail": { "description": text, "status": "not-started" } })
                }
                Value::Object(map) => {
                    let mut detail = serde_json::Map::new();
                    if let Some(kind) = map.get("kind").and_then(Value::as_str) {
                        detail.insert(
                            "kind".to_string(),
                            json!(activity_kind_resource_type(kind)),
                        );
                    }
                    detail.insert(
                        "status".to_string(),
                        json!(map.get("status").and_then(Value::as_str).unwrap_or("not-started")),
                    );
                    if let Some(desc) = map.get("description").and_then(Value::as_str) {
                        detail.insert("description".to_string(), json!(desc));
                    }
                    if let Some(timing) = map.get("scheduled_timing") {
                        detail.insert("scheduledTiming".to_string(), timing.clone());
                    } else if let Some(period) = map.get("scheduled_period") {
                        detail.insert("scheduledPeriod".to_string(), period.clone());
                    }
                    if let Some(location) = map.get("location").and_then(Value::as_str) {
                        detail.insert("location".to_string(), self.reference_value(location, "Location"));
                    }
                    if let Some(product) = map.get("product_reference") {
                        detail.insert("productReference".to_string(), product.clone());
                    } else if let Some(product) = map.get("product_codeable_concept") {
                        detail.insert("productCodeableConcept".to_string(), product.clone());
                    }
                    if let Some(quantity) = map.get("quantity") {
                        detail.insert("quantity".to_string(), quantity.clone());
                    }
                    if let Some(do_not) = map.get("do_not_perform").and_then(Value::as_bool) {
                        detail.insert("doNotPerform".to_string(), json!(do_not));
                    }
                    if let Some(performer) = map.get("performer").or_else(|| map.get("performers")) {
                        let performers: Vec<Value> = match performer {
                            Value::Array(items) => items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(|p| self.reference_value(p, "Practitioner"))
                                .collect(),
                            Value::String(s) => vec![self.reference_value(s, "Practitioner")],
                            _ => Vec::new(),
                        };
                        if !performers.is_empty() {
                            detail.insert("performer".to_string(), Value::Array(performers));
                        }
                    }
                    let mut activity_obj = serde_json::Map::new();
                    if let Some(goal) = map.get("goal") {
                        activity_obj.insert("outcomeReference".to_string(), json!([goal]));
                    }
                    activity_obj.insert("detail".to_string(), Value::Object(detail));
                    Value::Object(activity_obj)
                }
                _ => json!({}),
            })
            .collect();
        (!built.is_empty()).then_some(Value::Array(built))
    }
}

impl ResourceFactory for CarePlanFactory {
    fn name(&self) -> &'static str {
        "CarePlanResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, resource_type: &str) -> bool {
        resource_type == "CarePlan"
    }

    fn required_input_keys(&self, resource_type: &str) -> &'static [&'static str] {
        match resource_type {
            "CarePlan" => &["patient_id"],
            _ => &[],
        }
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        if resource_type != "CarePlan" {
            return Err(Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: format!("CarePlanFactory does not support {resource_type}"),
            });
        }

        let patient_id = first_alias_str(data, &["patient_id", "patient_ref", "subject"])
            .ok_or_else(|| Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: "patient_id is required".to_string(),
            })?;

        let mut resource = Resource::new("CarePlan");
        resource.set("subject", self.reference_value(patient_id, "Patient"));

        let status = data
            .get("status")
            .and_then(Value::as_str)
            .filter(|s| STATUSES.contains(s))
            .unwrap_or("active");
        resource.set("status", json!(status));

        let intent = data
            .get("intent")
            .and_then(Value::as_str)
            .filter(|s| INTENTS.contains(s))
            .unwrap_or("plan");
        resource.set("intent", json!(intent));

        resource.set("category", json!([self.category(data)]));

        let title = first_alias_str(data, &["title", "name"])
            .map(str::to_string)
            .unwrap_or_else(|| format!("Care Plan for Patient {patient_id}"));
        resource.set("title", json!(title));

        if let Some(description) = data.get("description").and_then(Value::as_str) {
            resource.set("description", json!(description));
        }

        if let Some(period) = self.period(data) {
            resource.set("period", period);
        }

        resource.set(
            "created",
            json!(data.get("created").and_then(Value::as_str).map(str::to_string).unwrap_or_else(|| Utc::now().to_rfc3339())),
        );

        if let Some(author) = first_alias_str(data, &["author", "practitioner_id"]) {
            resource.set("author", self.reference_value(author, "Practitioner"));
        }

        if let Some(care_team) = first_alias_str(data, &["care_team_id"]) {
            resource.set("careTeam", json!([self.reference_value(care_team, "CareTeam")]));
        }

        if let Some(conditions) = data.get("addresses").or_else(|| data.get("conditions")) {
            let items: Vec<&Value> = match conditions {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            let addresses: Vec<Value> = items
                .into_iter()
                .filter_map(Value::as_str)
                .map(|c| self.reference_value(c, "Condition"))
                .collect();
            if !addresses.is_empty() {
                resource.set("addresses", Value::Array(addresses));
            }
        }

        if let Some(goals) = self.goals(data) {
            resource.set("goal", goals);
        }
        if let Some(activities) = self.activities(data) {
            resource.set("activity", activities);
        }

        if let Some(notes) = data.get("notes").or_else(|| data.get("note")) {
            let items: Vec<&Value> = match notes {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            let note_entries: Vec<Value> = items
                .into_iter()
                .filter_map(Value::as_str)
                .map(|text| json!({ "text": text, "time": Utc::now().to_rfc3339() }))
                .collect();
            if !note_entries.is_empty() {
                resource.set("note", Value::Array(note_entries));
            }
        }

        Ok(resource)
    }
}

/// Classification entry point kept for symmetry with sibling factories that
/// use `classify_by_keyword` directly on free text (e.g. discharge notes).
pub fn classify_careplan_text(text: &str) -> &'static str {
    classify_by_keyword(
        text,
        &[
            ("assess", "assessment"),
            ("therap", "therapy"),
            ("educat", "education"),
            ("medicat", "medication"),
            ("diet", "diet"),
            ("exercis", "exercise"),
            ("discharge", "discharge"),
        ],
        "assessment",
    )
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
    fn defaults_status_and_intent() {
        let factory = CarePlanFactory::new(context());
        let data = json!({ "patient_id": "p1", "title": "Discharge planning" });
        let resource = factory.create("CarePlan", &data, None).unwrap();
        assert_eq!(resource.get("status").unwrap(), "active");
        assert_eq!(resource.get("intent").unwrap(), "plan");
        assert_eq!(resource.get("category").unwrap()[0]["coding"][0]["code"], "736366004");
    }

    #[test]
    fn computes_end_date_from_duration() {
        let factory = CarePlanFactory::new(context());
        let data = json!({
            "patient_id": "p1",
            "period_start": "2026-01-01",
            "duration_days": 30,
        });
        let resource = factory.create("CarePlan", &data, None).unwrap();
        assert_eq!(resource.get("period").unwrap()["end"], "2026-01-31");
    }

    #[test]
    fn rejects_invalid_status_with_default() {
        let factory = CarePlanFactory::new(context());
        let data = json!({ "patient_id": "p1", "status": "bogus" });
        let resource = factory.create("CarePlan", &data, None).unwrap();
        assert_eq!(resource.get("status").unwrap(), "active");
    }
}
