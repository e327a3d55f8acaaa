//! Encounter/Goal/CareTeam factory (C5).

use fhir_pipeline_models::Resource;
use serde_json::{json, Value};

use super::base::{first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use super::util::classify_by_keyword;
use crate::error::Result;

const LIFECYCLE_STATUSES: &[&str] = &[
    "proposed", "planned", "accepted", "active", "on-hold", "completed", "cancelled", "entered-in-error", "rejected",
];

const ACHIEVEMENT_STATUSES: &[&str] =
    &["in-progress", "improving", "worsening", "no-change", "achieved", "sustaining", "not-achieved", "no-progress", "not-attainable"];

pub struct EncounterFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
}

impl EncounterFactory {
    pub fn new(context: FactoryContext) -> Self {
        Self { context, metrics: FactoryMetrics::default() }
    }

    fn normalize_enum<'a>(raw: Option<&str>, allowed: &[&'a str], default: &'a str) -> &'a str {
        raw.and_then(|value| allowed.iter().find(|a| a.eq_ignore_ascii_case(value)).copied()).unwrap_or(default)
    }

    fn goal_priority(raw: Option<&str>) -> &'static str {
        match raw.unwrap_or("medium").to_lowercase().as_str() {
            "high" => "high-priority",
            "low" => "low-priority",
            _ => "medium-priority",
        }
    }

    fn goal_category(description: &str) -> &'static str {
        classify_by_keyword(
            description,
            &[
                ("diet", "dietary"),
                ("nutrition", "dietary"),
                ("safety", "safety"),
                ("fall", "safety"),
                ("behav", "behavioral"),
                ("nursing", "nursing"),
                ("physio", "physiotherapy"),
                ("mobility", "physiotherapy"),
            ],
            "nursing",
        )
    }

    fn goal_target(&self, target: &Value) -> Value {
        let mut entry = json!({});
        if let Some(measure) = target.get("measure") {
            entry["measure"] = measure.clone();
        }
        if let Some(quantity) = target.get("detail_quantity") {
            entry["detailQuantity"] = quantity.clone();
        } else if let Some(range) = target.get("detail_range") {
            entry["detailRange"] = range.clone();
        } else if let Some(concept) = target.get("detail_codeable_concept") {
            entry["detailCodeableConcept"] = concept.clone();
        }
        if let Some(due) = target.get("due_date").and_then(Value::as_str) {
            entry["dueDate"] = json!(due);
        }
        entry
    }
}

impl ResourceFactory for EncounterFactory {
    fn name(&self) -> &'static str {
        "EncounterResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, resource_type: &str) -> bool {
        matches!(resource_type, "Encounter" | "Goal" | "CareTeam")
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        let mut resource = Resource::new(resource_type);

        if let Some(subject) = first_alias_str(data, &["patient_id", "patient_ref", "subject"]) {
            resource.set("subject", self.reference_value(subject, "Patient"));
        }

        match resource_type {
            "Encounter" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("in-progress")));
                let class_code = data.get("class").and_then(Value::as_str).unwrap_or("AMB");
                resource.set(
                    "class",
                    json!({ "system": "http://terminology.hl7.org/CodeSystem/v3-ActCode", "code": class_code }),
                );
            }
            "CareTeam" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("active")));
            }
            "Goal" => {
                let lifecycle = Self::normalize_enum(data.get("lifecycle_status").and_then(Value::as_str), LIFECYCLE_STATUSES, "active");
                resource.set("lifecycleStatus", json!(lifecycle));

                if let Some(achievement) =
                    data.get("achievement_status").and_then(Value::as_str)
                {
                    let normalized = Self::normalize_enum(Some(achievement), ACHIEVEMENT_STATUSES, "in-progress");
                    resource.set(
                        "achievementStatus",
                        json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/goal-achievement", "code": normalized }] }),
                    );
                }

                resource.set(
                    "priority",
                    json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/goal-priority", "code": Self::goal_priority(data.get("priority").and_then(Value::as_str)) }] }),
                );

                let description = first_alias_str(data, &["description", "name"]).unwrap_or("");
                resource.set("description", json!({ "text": description }));
                resource.set(
                    "category",
                    json!([{ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/goal-category", "code": Self::goal_category(description) }] }]),
                );

                if let Some(targets) = data.get("targets").and_then(Value::as_array) {
                    let built: Vec<Value> = targets.iter().map(|t| self.goal_target(t)).collect();
                    if !built.is_empty() {
                        resource.set("target", Value::Array(built));
                    }
                }
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
    fn builds_minimal_encounter() {
        let factory = EncounterFactory::new(context());
        let data = json!({ "subject": "Patient/p1", "status": "in-progress", "class": "AMB" });
        let resource = factory.create("Encounter", &data, None).unwrap();
        assert_eq!(resource.get("class").unwrap()["code"], "AMB");
    }

    #[test]
    fn normalizes_unknown_goal_lifecycle_status_to_active() {
        let factory = EncounterFactory::new(context());
        let data = json!({ "subject": "Patient/p1", "lifecycle_status": "bogus", "description": "lose weight" });
        let resource = factory.create("Goal", &data, None).unwrap();
        assert_eq!(resource.get("lifecycleStatus").unwrap(), "active");
        assert_eq!(resource.get("category").unwrap()[0]["coding"][0]["code"], "dietary");
    }
}
