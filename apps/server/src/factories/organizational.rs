//! Organizational factory (C5): Location, Organization, HealthcareService.

use fhir_pipeline_models::Resource;
use serde_json::{json, Value};

use super::base::{first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use super::util::classify_by_keyword;
use crate::error::{Error, Result};

const LOCATION_TYPES: &[(&str, &str, &str)] = &[
    ("hospital", "22232009", "Hospital"),
    ("clinic", "35971002", "Ambulatory care site"),
    ("pharmacy", "264372000", "Pharmacy"),
    ("laboratory", "261904005", "Laboratory"),
    ("lab", "261904005", "Laboratory"),
    ("imaging", "309964003", "Radiology department"),
    ("emergency", "225728007", "Emergency department"),
    ("icu", "309904001", "Intensive care unit"),
    ("operating_room", "225746001", "Operating room"),
    ("or", "225746001", "Operating room"),
    ("ward", "225747005", "Ward"),
    ("outpatient", "33022008", "Outpatient clinic"),
    ("home", "264362003", "Home"),
    ("nursing_home", "42665001", "Nursing home"),
    ("mobile", "261904005", "Mobile unit"),
];

const PHYSICAL_TYPES: &[(&str, &str)] = &[
    ("site", "si"),
    ("building", "bu"),
    ("wing", "wi"),
    ("ward", "wa"),
    ("level", "lvl"),
    ("corridor", "co"),
    ("room", "ro"),
    ("bed", "bd"),
    ("vehicle", "ve"),
    ("house", "ho"),
    ("jurisdiction", "jdn"),
];

const SERVICE_CATEGORIES: &[(&str, &str, &str)] = &[
    ("general_practice", "1", "General Practice"),
    ("emergency", "2", "Emergency"),
    ("specialist", "3", "Specialist Medical"),
    ("diagnostic", "4", "Diagnostic"),
    ("pharmacy", "5", "Pharmacy"),
    ("mental_health", "6", "Mental Health"),
    ("rehabilitation", "7", "Rehabilitation"),
    ("aged_care", "8", "Aged Care"),
    ("palliative", "9", "Palliative Care"),
    ("dental", "10", "Dental"),
    ("allied_health", "11", "Allied Health"),
    ("hospital", "12", "Hospital"),
    ("transport", "13", "Transport"),
];

pub struct OrganizationalFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
}

impl OrganizationalFactory {
    pub fn new(context: FactoryContext) -> Self {
        Self { context, metrics: FactoryMetrics::default() }
    }

    fn location_type_coding(&self, raw: &str) -> Value {
        let key = raw.to_lowercase().replace(' ', "_");
        let (code, display) = LOCATION_TYPES
            .iter()
            .find(|(k, _, _)| *k == key)
            .map(|(_, code, display)| (*code, *display))
            .unwrap_or(("43741000", raw));
        self.context
            .coding
            .create_codeable_concept("SNOMED", code, Some(display), None)
            .unwrap_or_else(|_| json!({ "text": raw }))
    }

    fn physical_type_coding(&self, raw: &str) -> Value {
        let key = raw.to_lowercase();
        let code = PHYSICAL_TYPES.iter().find(|(k, _)| *k == key).map(|(_, c)| *c).unwrap_or("area");
        json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/location-physical-type", "code": code }] })
    }

    fn position(&self, data: &Value) -> Option<Value> {
        let src = data.get("position").filter(|v| v.is_object()).unwrap_or(data);
        let lat = src.get("latitude").or_else(|| src.get("lat")).and_then(Value::as_f64);
        let lng = src
            .get("longitude")
            .or_else(|| src.get("lng"))
            .or_else(|| src.get("lon"))
            .and_then(Value::as_f64);
        if lat.is_none() && lng.is_none() {
            return None;
        }
        let mut position = serde_json::Map::new();
        if let Some(lat) = lat {
            position.insert("latitude".to_string(), json!(lat));
        }
        if let Some(lng) = lng {
            position.insert("longitude".to_string(), json!(lng));
        }
        if let Some(alt) = src.get("altitude").and_then(Value::as_f64) {
            position.insert("altitude".to_string(), json!(alt));
        }
        Some(Value::Object(position))
    }

    fn hours_of_operation(&self, data: &Value) -> Option<Value> {
        let raw = data.get("hours_of_operation")?;
        let items: Vec<&Value> = match raw {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let entries: Vec<Value> = items
            .into_iter()
            .filter_map(|hours| hours.as_object())
            .map(|hours| {
                let mut entry = serde_json::Map::new();
                if let Some(days) = hours.get("days_of_week") {
                    let days_list: Vec<Value> = match days {
                        Value::Array(items) => items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(|d| json!(d.to_lowercase()))
                            .collect(),
                        Value::String(s) => vec![json!(s.to_lowercase())],
                        _ => Vec::new(),
                    };
                    entry.insert("daysOfWeek".to_string(), Value::Array(days_list));
                }
                if let Some(all_day) = hours.get("all_day").and_then(Value::as_bool) {
                    entry.insert("allDay".to_string(), json!(all_day));
                }
                if let Some(opening) = hours.get("opening_time") {
                    entry.insert("openingTime".to_string(), opening.clone());
                }
                if let Some(closing) = hours.get("closing_time") {
                    entry.insert("closingTime".to_string(), closing.clone());
                }
                Value::Object(entry)
            })
            .collect();
        (!entries.is_empty()).then_some(Value::Array(entries))
    }

    fn build_location(&self, data: &Value) -> Resource {
        let mut resource = Resource::new("Location");
        resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("active")));

        if let Some(name) = data.get("name").and_then(Value::as_str) {
            resource.set("name", json!(name));
        }
        if let Some(alias) = data.get("alias") {
            let aliases = match alias {
                Value::String(s) => vec![json!(s)],
                Value::Array(items) => items.clone(),
                _ => Vec::new(),
            };
            if !aliases.is_empty() {
                resource.set("alias", Value::Array(aliases));
            }
        }
        if let Some(mode) = data.get("mode").and_then(Value::as_str) {
            let mode = mode.to_lowercase();
            if mode == "instance" || mode == "kind" {
                resource.set("mode", json!(mode));
            }
        }
        if let Some(location_type) = data.get("type").and_then(Value::as_str) {
            resource.set("type", json!([self.location_type_coding(location_type)]));
        }
        if let Some(physical_type) = data.get("physical_type").and_then(Value::as_str) {
            resource.set("physicalType", self.physical_type_coding(physical_type));
        }
        if let Some(address) = data.get("address") {
            resource.set("address", address.clone());
        }
        if let Some(position) = self.position(data) {
            resource.set("position", position);
        }
        if let Some(managing_org) = first_alias_str(data, &["managing_organization"]) {
            resource.set("managingOrganization", self.reference_value(managing_org, "Organization"));
        }
        if let Some(part_of) = first_alias_str(data, &["part_of"]) {
            resource.set("partOf", self.reference_value(part_of, "Location"));
        }
        if let Some(hours) = self.hours_of_operation(data) {
            resource.set("hoursOfOperation", hours);
        }
        resource
    }

    fn build_organization(&self, data: &Value) -> Resource {
        let mut resource = Resource::new("Organization");
        resource.set("active", json!(data.get("active").and_then(Value::as_bool).unwrap_or(true)));

        if let Some(name) = data.get("name").and_then(Value::as_str) {
            resource.set("name", json!(name));
        }

        let mut identifiers = Vec::new();
        if let Some(npi) = data.get("npi").and_then(Value::as_str) {
            identifiers.push(json!({
                "type": { "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/v2-0203", "code": "NPI" }] },
                "system": "http://hl7.org/fhir/sid/us-npi",
                "value": npi,
            }));
        }
        if let Some(tax_id) = first_alias_str(data, &["tax_id", "ein"]) {
            identifiers.push(json!({
                "type": { "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/v2-0203", "code": "TAX" }] },
                "value": tax_id,
            }));
        }
        if !identifiers.is_empty() {
            resource.set("identifier", Value::Array(identifiers));
        }

        if let Some(contacts) = data.get("contacts").and_then(Value::as_array) {
            let built: Vec<Value> = contacts
                .iter()
                .filter_map(|c| c.as_object())
                .map(|c| {
                    let mut contact = serde_json::Map::new();
                    if let Some(purpose) = c.get("purpose").and_then(Value::as_str) {
                        contact.insert(
                            "purpose".to_string(),
                            json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/v3-ParticipationType", "code": purpose }] }),
                        );
                    }
                    if let Some(name) = c.get("name") {
                        contact.insert("name".to_string(), name.clone());
                    }
                    if let Some(telecom) = c.get("telecom") {
                        contact.insert("telecom".to_string(), telecom.clone());
                    }
                    Value::Object(contact)
                })
                .collect();
            if !built.is_empty() {
                resource.set("contact", Value::Array(built));
            }
        }

        if let Some(part_of) = first_alias_str(data, &["part_of"]) {
            resource.set("partOf", self.reference_value(part_of, "Organization"));
        }
        resource
    }

    fn service_category(&self, raw: &str) -> Value {
        let key = raw.to_lowercase().replace(' ', "_");
        let (code, display) = SERVICE_CATEGORIES
            .iter()
            .find(|(k, _, _)| *k == key)
            .map(|(_, code, display)| (*code, *display))
            .unwrap_or(("0", raw));
        json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/service-category", "code": code, "display": display }] })
    }

    fn build_healthcare_service(&self, data: &Value) -> Resource {
        let mut resource = Resource::new("HealthcareService");
        resource.set("active", json!(data.get("active").and_then(Value::as_bool).unwrap_or(true)));

        if let Some(name) = data.get("name").and_then(Value::as_str) {
            resource.set("name", json!(name));
        }
        if let Some(provider) = first_alias_str(data, &["provided_by", "organization_id"]) {
            resource.set("providedBy", self.reference_value(provider, "Organization"));
        }
        if let Some(category) = data.get("category").and_then(Value::as_str) {
            resource.set("category", json!([self.service_category(category)]));
        }
        if let Some(specialty) = data.get("specialty") {
            let specialties: Vec<&str> = match specialty {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            let concepts: Vec<Value> = specialties
                .into_iter()
                .filter_map(|s| self.context.coding.create_codeable_concept("SNOMED", s, None, Some(s)).ok())
                .collect();
            if !concepts.is_empty() {
                resource.set("specialty", Value::Array(concepts));
            }
        }
        if let Some(eligibility) = data.get("eligibility") {
            let items: Vec<&Value> = match eligibility {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            let built: Vec<Value> = items
                .into_iter()
                .filter_map(|e| e.as_object())
                .map(|e| {
                    let mut entry = serde_json::Map::new();
                    if let Some(code) = e.get("code").and_then(Value::as_str) {
                        entry.insert(
                            "code".to_string(),
                            json!({ "coding": [{ "system": "http://terminology.hl7.org/CodeSystem/service-eligibility", "code": code }] }),
                        );
                    }
                    if let Some(comment) = e.get("comment") {
                        entry.insert("comment".to_string(), comment.clone());
                    }
                    Value::Object(entry)
                })
                .collect();
            if !built.is_empty() {
                resource.set("eligibility", Value::Array(built));
            }
        }
        if let Some(slots) = data.get("availability").and_then(Value::as_array) {
            let built: Vec<Value> = slots
                .iter()
                .filter_map(|s| s.as_object())
                .map(|s| {
                    let mut entry = serde_json::Map::new();
                    if let Some(days) = s.get("days_of_week").and_then(Value::as_array) {
                        entry.insert(
                            "daysOfWeek".to_string(),
                            Value::Array(days.iter().filter_map(Value::as_str).map(|d| json!(d.to_lowercase())).collect()),
                        );
                    }
                    if let Some(start) = s.get("available_start_time") {
                        entry.insert("availableStartTime".to_string(), start.clone());
                    }
                    if let Some(end) = s.get("available_end_time") {
                        entry.insert("availableEndTime".to_string(), end.clone());
                    }
                    Value::Object(entry)
                })
                .collect();
            if !built.is_empty() {
                resource.set("availableTime", Value::Array(built));
            }
        }
        if let Some(not_available) = data.get("not_available").and_then(Value::as_array) {
            let built: Vec<Value> = not_available
                .iter()
                .filter_map(|n| n.as_object())
                .map(|n| {
                    let mut entry = serde_json::Map::new();
                    if let Some(desc) = n.get("description") {
                        entry.insert("description".to_string(), desc.clone());
                    }
                    if let Some(during) = n.get("during") {
                        entry.insert("during".to_string(), during.clone());
                    }
                    Value::Object(entry)
                })
                .collect();
            if !built.is_empty() {
                resource.set("notAvailable", Value::Array(built));
            }
        }
        if let Some(referral) = data.get("referral_method").and_then(Value::as_str) {
            resource.set("referralMethod", json!([{ "coding": [{ "code": referral }] }]));
        }
        if let Some(required) = data.get("appointment_required").and_then(Value::as_bool) {
            resource.set("appointmentRequired", json!(required));
        }
        resource
    }

    fn classify_service_category_by_keyword(name: &str) -> &'static str {
        classify_by_keyword(
            name,
            &[
                ("emergency", "emergency"),
                ("pharmacy", "pharmacy"),
                ("dental", "dental"),
                ("mental", "mental_health"),
                ("rehab", "rehabilitation"),
            ],
            "general_practice",
        )
    }
}

impl ResourceFactory for OrganizationalFactory {
    fn name(&self) -> &'static str {
        "OrganizationalResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, resource_type: &str) -> bool {
        matches!(resource_type, "Location" | "Organization" | "HealthcareService")
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        match resource_type {
            "Location" => Ok(self.build_location(data)),
            "Organization" => Ok(self.build_organization(data)),
            "HealthcareService" => {
                let mut resource = self.build_healthcare_service(data);
                if resource.get("category").is_none() {
                    if let Some(name) = data.get("name").and_then(Value::as_str) {
                        let category = Self::classify_service_category_by_keyword(name);
                        resource.set("category", json!([self.service_category(category)]));
                    }
                }
                Ok(resource)
            }
            other => Err(Error::FactoryInput {
                resource_type: other.to_string(),
                message: format!("OrganizationalFactory does not support {other}"),
            }),
        }
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
    fn location_type_resolves_snomed_code() {
        let factory = OrganizationalFactory::new(context());
        let data = json!({ "name": "Main ICU", "type": "icu" });
        let resource = factory.create("Location", &data, None).unwrap();
        assert_eq!(resource.get("type").unwrap()[0]["coding"][0]["code"], "309904001");
    }

    #[test]
    fn organization_npi_identifier_uses_us_npi_system() {
        let factory = OrganizationalFactory::new(context());
        let data = json!({ "name": "General Hospital", "npi": "1234567890" });
        let resource = factory.create("Organization", &data, None).unwrap();
        assert_eq!(resource.get("identifier").unwrap()[0]["system"], "http://hl7.org/fhir/sid/us-npi");
    }

    #[test]
    fn healthcare_service_infers_category_from_name() {
        let factory = OrganizationalFactory::new(context());
        let data = json!({ "name": "Downtown Pharmacy" });
        let resource = factory.create("HealthcareService", &data, None).unwrap();
        assert_eq!(resource.get("category").unwrap()[0]["coding"][0]["code"], "5");
    }
}
