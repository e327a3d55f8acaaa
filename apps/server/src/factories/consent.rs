//! Consent factory (C5): FHIR R4 Consent with granular privacy controls.
//!
//! R4's `provision` is a single object, not an array — later FHIR releases
//! changed this shape, but the external validator this pipeline targets is
//! R4, so callers must not be tempted to "fix" it into a list.

use chrono::Utc;
use fhir_pipeline_models::Resource;
use serde_json::{json, Value};

use super::base::{first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use crate::error::{Error, Result};

const STATUSES: &[&str] = &["active", "inactive", "draft", "rejected"];

fn purpose_display(code: &str) -> &str {
    match code {
        "TREAT" => "Treatment",
        "HPAYMT" => "Healthcare Payment",
        "HOPERAT" => "Healthcare Operations",
        "HMARKT" => "Marketing",
        "HRESCH" => "Healthcare Research",
        other => other,
    }
}

fn role_display(code: &str) -> &str {
    match code {
        "PRCP" => "Primary Care Provider",
        "CONSULT" => "Consultant",
        "ECON" => "Emergency Contact",
        other => other,
    }
}

fn category_loinc(category: &str) -> &'static str {
    match category {
        "HIPAA" => "59284-0",
        "research" => "64292-6",
        "marketing" => "59284-0",
        _ => "59284-0",
    }
}

pub struct ConsentFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
}

impl ConsentFactory {
    pub fn new(context: FactoryContext) -> Self {
        Self { context, metrics: FactoryMetrics::default() }
    }

    fn provision(&self, data: &Value) -> Option<Value> {
        let mut provision = serde_json::Map::new();

        if let Some(purposes) = data.get("purpose").and_then(Value::as_array) {
            let entries: Vec<Value> = purposes
                .iter()
                .filter_map(Value::as_str)
                .map(|code| {
                    json!({
                        "system": "http://terminology.hl7.org/CodeSystem/v3-ActReason",
                        "code": code,
                        "display": purpose_display(code),
                    })
                })
                .collect();
            if !entries.is_empty() {
                provision.insert("purpose".to_string(), Value::Array(entries));
            }
        }

        if let Some(actor_id) = data.get("actor_id").and_then(Value::as_str) {
            let role_code = data.get("actor_role").and_then(Value::as_str).unwrap_or("PRCP");
            provision.insert(
                "actor".to_string(),
                json!([{
                    "role": {
                        "coding": [{
                            "system": "http://terminology.hl7.org/CodeSystem/v3-ParticipationType",
                            "code": role_code,
                            "display": role_display(role_code),
                        }]
                    },
                    "reference": { "reference": actor_id },
                }]),
            );
        }

        if data.get("period_start").is_some() || data.get("period_end").is_some() {
            let mut period = serde_json::Map::new();
            if let Some(start) = data.get("period_start") {
                period.insert("start".to_string(), start.clone());
            }
            if let Some(end) = data.get("period_end") {
                period.insert("end".to_string(), end.clone());
            }
            provision.insert("period".to_string(), Value::Object(period));
        }

        (!provision.is_empty()).then_some(Value::Object(provision))
    }
}

impl ResourceFactory for ConsentFactory {
    fn name(&self) -> &'static str {
        "ConsentResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, resource_type: &str) -> bool {
        resource_type == "Consent"
    }

    fn required_input_keys(&self, resource_type: &str) -> &'static [&'static str] {
        match resource_type {
            "Consent" => &["status", "category", "patient_id"],
            _ => &[],
        }
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        if resource_type != "Consent" {
            return Err(Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: format!("ConsentFactory does not support {resource_type}"),
            });
        }

        let status = data.get("status").and_then(Value::as_str).unwrap_or("");
        if !STATUSES.contains(&status) {
            return Err(Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: format!("invalid Consent status: {status}"),
            });
        }

        let categories = data.get("category").and_then(Value::as_array).ok_or_else(|| Error::FactoryInput {
            resource_type: resource_type.to_string(),
            message: "category must be a non-empty list".to_string(),
        })?;
        if categories.is_empty() {
            return Err(Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: "category must be a non-empty list".to_string(),
            });
        }

        let patient_id = data.get("patient_id").and_then(Value::as_str).ok_or_else(|| Error::FactoryInput {
            resource_type: resource_type.to_string(),
            message: "patient_id is required".to_string(),
        })?;
        if !patient_id.starts_with("Patient/") {
            return Err(Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: "patient_id must be a Patient reference (Patient/...)".to_string(),
            });
        }

        let mut resource = Resource::new("Consent");
        resource.set("status", json!(status));

        let scope = data.get("scope").and_then(Value::as_str).unwrap_or("patient-privacy");
        resource.set(
            "scope",
            json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/consentscope", "code": scope }] }),
        );

        let category_concepts: Vec<Value> = categories
            .iter()
            .filter_map(Value::as_str)
            .map(|category| {
                json!({ "coding": [{ "system": "http://loinc.org", "code": category_loinc(category) }] })
            })
            .collect();
        resource.set("category", Value::Array(category_concepts));

        resource.set("patient", self.reference_value(patient_id, "Patient"));

        let date_time = data
            .get("date_time")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        resource.set("dateTime", json!(date_time));

        let policy_rule = data.get("policy_rule").and_then(Value::as_str).unwrap_or("OPTIN");
        resource.set(
            "policyRule",
            json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/v3-ActCode", "code": policy_rule }] }),
        );

        if let Some(provision) = self.provision(data) {
            resource.set("provision", provision);
        }

        if let Some(org) = first_alias_str(data, &["organization_id"]) {
            resource.set("organization", json!([self.reference_value(org, "Organization")]));
        }

        if let Some(performer) = first_alias_str(data, &["performer"]) {
            resource.set("performer", json!([self.reference_value(performer, "Practitioner")]));
        }

        Ok(resource)
    }
}

/// `check_consent` (§4.5): returns `false` unless the consent is active,
/// its validity period (if present) currently includes today, its
/// provision's purpose/actor lists (if present) include the requested
/// context, and finally its `policyRule` is `OPTIN`.
pub fn check_consent(consent: &Resource, purpose: &str, actor_id: Option<&str>) -> bool {
    if !is_consent_active(consent) {
        return false;
    }

    let policy_code = consent
        .get("policyRule")
        .and_then(|p| p.get("coding"))
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("OPTOUT");
    let is_optin = policy_code == "OPTIN";

    let Some(provision) = consent.get("provision") else {
        return is_optin;
    };

    if let Some(purposes) = provision.get("purpose").and_then(Value::as_array) {
        let codes: Vec<&str> = purposes.iter().filter_map(|p| p.get("code").and_then(Value::as_str)).collect();
        if !codes.contains(&purpose) {
            return false;
        }
    }

    if let Some(actor_id) = actor_id {
        if let Some(actors) = provision.get("actor").and_then(Value::as_array) {
            let refs: Vec<&str> = actors
                .iter()
                .filter_map(|a| a.get("reference").and_then(|r| r.get("reference")).and_then(Value::as_str))
                .collect();
            if !refs.contains(&actor_id) {
                return false;
            }
        }
    }

    is_optin
}

/// `is_consent_active` (§4.5/§8): status must be `active` and, if a
/// provision period is present, today must fall within `[start, end]`.
pub fn is_consent_active(consent: &Resource) -> bool {
    if consent.get("status").and_then(Value::as_str) != Some("active") {
        return false;
    }

    let Some(period) = consent.get("provision").and_then(|p| p.get("period")) else {
        return true;
    };

    let today = Utc::now().date_naive();

    if let Some(start) = period.get("start").and_then(Value::as_str) {
        if let Ok(start_date) = chrono::NaiveDate::parse_from_str(&start[..10.min(start.len())], "%Y-%m-%d") {
            if today < start_date {
                return false;
            }
        }
    }
    if let Some(end) = period.get("end").and_then(Value::as_str) {
        if let Ok(end_date) = chrono::NaiveDate::parse_from_str(&end[..10.min(end.len())], "%Y-%m-%d") {
            if today > end_date {
                return false;
            }
        }
    }
    true
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

    fn opt_out_consent() -> Resource {
        let factory = ConsentFactory::new(context());
        let data = json!({
            "status": "active",
            "scope": "patient-privacy",
            "category": ["HIPAA"],
            "patient_id": "Patient/p1",
            "policy_rule": "OPTOUT",
            "purpose": ["HMARKT"],
        });
        factory.create("Consent", &data, None).unwrap()
    }

    #[test]
    fn optout_consent_never_permits_any_purpose() {
        let consent = opt_out_consent();
        assert!(!check_consent(&consent, "HMARKT", None));
        assert!(!check_consent(&consent, "TREAT", None));
    }

    #[test]
    fn optout_consent_is_still_considered_active() {
        let consent = opt_out_consent();
        assert!(is_consent_active(&consent));
    }

    #[test]
    fn rejects_patient_id_without_patient_prefix() {
        let factory = ConsentFactory::new(context());
        let data = json!({ "status": "active", "category": ["HIPAA"], "patient_id": "p1" });
        let err = factory.create("Consent", &data, None).unwrap_err();
        assert!(matches!(err, Error::FactoryInput { .. }));
    }

    #[test]
    fn expired_validity_period_is_not_active() {
        let factory = ConsentFactory::new(context());
        let data = json!({
            "status": "active",
            "category": ["HIPAA"],
            "patient_id": "Patient/p1",
            "period_start": "2000-01-01",
            "period_end": "2000-12-31",
        });
        let consent = factory.create("Consent", &data, None).unwrap();
        assert!(!is_consent_active(&consent));
    }
}
