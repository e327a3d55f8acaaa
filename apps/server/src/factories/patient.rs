//! Patient/RelatedPerson/Person/PractitionerRole factory (C5).

use fhir_pipeline_models::Resource;
use serde_json::{json, Value};

use super::base::{first_alias, first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use super::util::{normalize_gender, normalize_phone, normalize_ssn, parse_flexible_date, split_name};
use crate::error::{Error, Result};

pub struct PatientFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
}

impl PatientFactory {
    pub fn new(context: FactoryContext) -> Self {
        Self { context, metrics: FactoryMetrics::default() }
    }

    fn build_name(&self, data: &Value) -> Option<Value> {
        if let Some(list) = data.get("names").and_then(Value::as_array) {
            let names: Vec<Value> = list.iter().filter_map(|n| n.as_str()).map(Self::name_entry_from_str).collect();
            if !names.is_empty() {
                return Some(Value::Array(names));
            }
        }

        if let Some(raw) = data.get("name").and_then(Value::as_str) {
            return Some(Value::Array(vec![Self::name_entry_from_str(raw)]));
        }

        let family = first_alias_str(data, &["last_name", "family"]);
        let given: Vec<&str> = first_alias_str(data, &["first_name", "given"])
            .into_iter()
            .chain(data.get("middle_name").and_then(Value::as_str))
            .collect();

        if family.is_none() && given.is_empty() {
            return None;
        }

        let mut entry = json!({ "use": "official" });
        if let Some(family) = family {
            entry["family"] = json!(family);
        }
        if !given.is_empty() {
            entry["given"] = json!(given);
        }
        if let Some(prefix) = data.get("prefix").and_then(Value::as_str) {
            entry["prefix"] = json!([prefix]);
        }
        if let Some(suffix) = data.get("suffix").and_then(Value::as_str) {
            entry["suffix"] = json!([suffix]);
        }
        Some(Value::Array(vec![entry]))
    }

    fn name_entry_from_str(raw: &str) -> Value {
        let (family, given) = split_name(raw);
        json!({ "use": "official", "family": family, "given": given })
    }

    fn build_identifiers(&self, data: &Value) -> Vec<Value> {
        let mut identifiers = Vec::new();
        if let Some(mrn) = data.get("mrn").and_then(Value::as_str) {
            identifiers.push(json!({
                "type": { "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/v2-0203",
                    "code": "MR"
                }] },
                "system": "http://hospital.local/patient-id",
                "value": mrn
            }));
        }
        if let Some(ssn) = data.get("ssn").and_then(Value::as_str) {
            if let Some(normalized) = normalize_ssn(ssn) {
                identifiers.push(json!({
                    "type": { "coding": [{
                        "system": "http://terminology.hl7.org/CodeSystem/v2-0203",
                        "code": "SS"
                    }] },
                    "system": "http://hl7.org/fhir/sid/us-ssn",
                    "value": normalized
                }));
            }
        }
        identifiers
    }

    fn build_telecom(&self, data: &Value) -> Vec<Value> {
        let mut telecom = Vec::new();
        if let Some(phone) = first_alias_str(data, &["phone", "phone_number"]) {
            telecom.push(json!({ "system": "phone", "value": normalize_phone(phone), "use": "home" }));
        }
        if let Some(email) = data.get("email").and_then(Value::as_str) {
            telecom.push(json!({ "system": "email", "value": email }));
        }
        telecom
    }

    fn build_emergency_contacts(&self, data: &Value) -> Vec<Value> {
        let Some(contacts) = data.get("emergency_contacts").and_then(Value::as_array) else {
            return Vec::new();
        };
        contacts
            .iter()
            .filter_map(|contact| {
                let name = contact.get("name").and_then(Value::as_str)?;
                let (family, given) = split_name(name);
                let relationship = contact.get("relationship").and_then(Value::as_str).unwrap_or("C");
                let mut entry = json!({
                    "relationship": [{ "coding": [{
                        "system": "http://terminology.hl7.org/CodeSystem/v3-RoleCode",
                        "code": relationship
                    }] }],
                    "name": { "family": family, "given": given }
                });
                if let Some(phone) = contact.get("phone").and_then(Value::as_str) {
                    entry["telecom"] = json!([{ "system": "phone", "value": normalize_phone(phone) }]);
                }
                Some(entry)
            })
            .collect()
    }
}

impl ResourceFactory for PatientFactory {
    fn name(&self) -> &'static str {
        "PatientResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, resource_type: &str) -> bool {
        matches!(resource_type, "Patient" | "RelatedPerson" | "Person" | "PractitionerRole" | "Practitioner")
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        let mut resource = Resource::new(resource_type);

        if resource_type == "PractitionerRole" {
            if let Some(practitioner) = first_alias_str(data, &["practitioner_id", "practitioner_ref"]) {
                resource.set("practitioner", self.reference_value(practitioner, "Practitioner"));
            }
            if let Some(organization) = first_alias_str(data, &["organization_id", "organization_ref"]) {
                resource.set("organization", self.reference_value(organization, "Organization"));
            }
            resource.set("active", json!(true));
            return Ok(resource);
        }

        if let Some(name) = self.build_name(data) {
            resource.set("name", name);
        }

        let identifiers = self.build_identifiers(data);
        if !identifiers.is_empty() {
            resource.set("identifier", Value::Array(identifiers));
        }

        let telecom = self.build_telecom(data);
        if !telecom.is_empty() {
            resource.set("telecom", Value::Array(telecom));
        }

        if resource_type == "Patient" {
            resource.set("active", json!(true));

            if let Some(gender) = data.get("gender").and_then(Value::as_str) {
                resource.set("gender", json!(normalize_gender(gender)));
            }

            if let Some(birth_date) = data.get("birthDate").and_then(Value::as_str).or_else(|| data.get("birth_date").and_then(Value::as_str)) {
                let parsed = parse_flexible_date(birth_date).ok_or_else(|| Error::FactoryInput {
                    resource_type: resource_type.to_string(),
                    message: format!("unrecognized birth date format: {birth_date}"),
                })?;
                resource.set("birthDate", json!(parsed));
            }

            if let Some(status) = data.get("marital_status").and_then(Value::as_str) {
                resource.set(
                    "maritalStatus",
                    json!({ "coding": [{
                        "system": "http://terminology.hl7.org/CodeSystem/v3-MaritalStatus",
                        "code": status.to_uppercase()
                    }] }),
                );
            }

            if let Some(language) = data.get("language").and_then(Value::as_str) {
                resource.set(
                    "communication",
                    json!([{ "language": { "coding": [{
                        "system": "urn:ietf:bcp:47",
                        "code": language
                    }] } }]),
                );
            }

            let contacts = self.build_emergency_contacts(data);
            if !contacts.is_empty() {
                resource.set("contact", Value::Array(contacts));
            }

            if let Some(gp) = first_alias(data, &["general_practitioner_id", "general_practitioner_ref"]).and_then(Value::as_str) {
                resource.set("generalPractitioner", json!([self.reference_value(gp, "Practitioner")]));
            }

            if let Some(org) = first_alias_str(data, &["managing_organization_id", "managing_organization_ref"]) {
                resource.set("managingOrganization", self.reference_value(org, "Organization"));
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
    fn builds_patient_with_split_name_and_mrn() {
        let factory = PatientFactory::new(context());
        let data = json!({ "name": "Doe, Jane", "mrn": "12345", "gender": "f", "birthDate": "1990-01-02" });
        let resource = factory.create("Patient", &data, None).unwrap();
        assert_eq!(resource.get("gender").unwrap(), "female");
        assert_eq!(resource.get("birthDate").unwrap(), "1990-01-02");
        assert_eq!(resource.get("name").unwrap()[0]["family"], "Doe");
    }

    #[test]
    fn rejects_unparseable_birth_date() {
        let factory = PatientFactory::new(context());
        let data = json!({ "name": "Jane Doe", "birthDate": "not-a-date" });
        assert!(factory.create("Patient", &data, None).is_err());
    }

    #[test]
    fn normalizes_ssn_identifier() {
        let factory = PatientFactory::new(context());
        let data = json!({ "name": "Jane Doe", "ssn": "123456789" });
        let resource = factory.create("Patient", &data, None).unwrap();
        let identifiers = resource.get("identifier").unwrap().as_array().unwrap();
        assert_eq!(identifiers[0]["value"], "123-45-6789");
    }
}
