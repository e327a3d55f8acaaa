//! Device/DeviceUseStatement/DeviceMetric factory (C5).

use fhir_pipeline_models::Resource;
use serde_json::{json, Value};

use super::base::{first_alias_str, FactoryContext, FactoryMetrics, ResourceFactory};
use super::util::classify_by_keyword;
use crate::error::Result;

const DEVICE_TYPE_SNOMED: &[(&str, &str)] = &[
    ("iv pump", "182722004"),
    ("pca pump", "462261006"),
    ("syringe pump", "303490004"),
    ("ventilator", "706172005"),
    ("defibrillator", "18641002"),
    ("monitor", "69405008"),
];

const DEVICE_METRIC_LOINC: &[(&str, &str)] = &[
    ("heart_rate", "8867-4"),
    ("blood_pressure", "85354-9"),
    ("temperature", "8310-5"),
    ("oxygen_saturation", "2708-6"),
    ("flow_rate", "3151-8"),
];

pub struct DeviceFactory {
    context: FactoryContext,
    metrics: FactoryMetrics,
}

impl DeviceFactory {
    pub fn new(context: FactoryContext) -> Self {
        Self { context, metrics: FactoryMetrics::default() }
    }
}

impl ResourceFactory for DeviceFactory {
    fn name(&self) -> &'static str {
        "DeviceResourceFactory"
    }

    fn context(&self) -> &FactoryContext {
        &self.context
    }

    fn metrics(&self) -> &FactoryMetrics {
        &self.metrics
    }

    fn supports(&self, resource_type: &str) -> bool {
        matches!(resource_type, "Device" | "DeviceUseStatement" | "DeviceMetric" | "DeviceRequest")
    }

    fn build(&self, resource_type: &str, data: &Value, _request_id: Option<&str>) -> Result<Resource> {
        let mut resource = Resource::new(resource_type);

        match resource_type {
            "Device" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("active")));
                let name = first_alias_str(data, &["name", "device_name"]).unwrap_or("Device");
                resource.set("deviceName", json!([{ "name": name, "type": "user-friendly-name" }]));

                let type_keyword = data
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| classify_by_keyword(name, &[], "").to_string());
                let resolved = if type_keyword.is_empty() { name } else { type_keyword.as_str() };
                let code = classify_by_keyword(resolved, DEVICE_TYPE_SNOMED, "");
                if !code.is_empty() {
                    resource.set(
                        "type",
                        json!({ "coding": [{ "system": "http://snomed.info/sct", "code": code, "display": resolved }] }),
                    );
                } else if data.get("type").is_some() {
                    resource.set("type", json!({ "text": resolved }));
                }
            }
            "DeviceUseStatement" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("active")));
                if let Some(subject) = first_alias_str(data, &["patient_id", "patient_ref", "subject"]) {
                    resource.set("subject", self.reference_value(subject, "Patient"));
                }
                if let Some(device) = first_alias_str(data, &["device_id", "device_ref", "device"]) {
                    resource.set("device", self.reference_value(device, "Device"));
                }
            }
            "DeviceRequest" => {
                resource.set("status", json!(data.get("status").and_then(Value::as_str).unwrap_or("active")));
                resource.set("intent", json!(data.get("intent").and_then(Value::as_str).unwrap_or("order")));
                if let Some(subject) = first_alias_str(data, &["patient_id", "patient_ref", "subject"]) {
                    resource.set("subject", self.reference_value(subject, "Patient"));
                }
                if let Some(device) = first_alias_str(data, &["device_id", "device_ref", "device"]) {
                    resource.set("codeReference", self.reference_value(device, "Device"));
                }
            }
            "DeviceMetric" => {
                resource.set("category", json!(data.get("category").and_then(Value::as_str).unwrap_or("measurement")));
                let metric_type = first_alias_str(data, &["type", "metric_type"]).unwrap_or("");
                let normalized = metric_type.to_lowercase().replace(' ', "_");
                if let Some((_, code)) = DEVICE_METRIC_LOINC.iter().find(|(keyword, _)| *keyword == normalized) {
                    resource.set("type", json!({ "coding": [{ "system": "http://loinc.org", "code": code, "display": metric_type }] }));
                } else if !metric_type.is_empty() {
                    resource.set("type", json!({ "text": metric_type }));
                }
                if let Some(source) = first_alias_str(data, &["device_id", "device_ref", "source"]) {
                    resource.set("source", self.reference_value(source, "Device"));
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
    fn infers_device_type_from_name_keyword() {
        let factory = DeviceFactory::new(context());
        let data = json!({ "name": "IV Pump Model X" });
        let resource = factory.create("Device", &data, None).unwrap();
        assert_eq!(resource.get("type").unwrap()["coding"][0]["code"], "182722004");
    }

    #[test]
    fn codes_device_metric_with_loinc() {
        let factory = DeviceFactory::new(context());
        let data = json!({ "type": "heart_rate" });
        let resource = factory.create("DeviceMetric", &data, None).unwrap();
        assert_eq!(resource.get("type").unwrap()["coding"][0]["code"], "8867-4");
    }
}
