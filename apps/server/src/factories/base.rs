//! Template-method workflow shared by every specialized factory (C4).

use std::sync::Arc;
use std::time::Instant;

use fhir_pipeline_coding::CodingRegistry;
use fhir_pipeline_models::Resource;
use fhir_pipeline_reference::ReferenceManager;
use fhir_pipeline_validator::ValidatorRegistry;
use serde_json::Value;

use crate::error::{Error, Result};

/// Shared components every factory needs: coding lookups, structural
/// validation, and reference formatting. Cloned cheaply (all `Arc`).
#[derive(Clone)]
pub struct FactoryContext {
    pub coding: Arc<CodingRegistry>,
    pub validators: Arc<ValidatorRegistry>,
    pub references: Arc<ReferenceManager>,
}

/// Running performance counters for one factory instance, reported by
/// `/fhir/performance/metrics` and the per-factory `health_check`.
#[derive(Default)]
pub struct FactoryMetrics {
    created: std::sync::atomic::AtomicU64,
    failed: std::sync::atomic::AtomicU64,
    validated: std::sync::atomic::AtomicU64,
    total_micros: std::sync::atomic::AtomicU64,
}

impl FactoryMetrics {
    fn record(&self, elapsed: std::time::Duration, success: bool) {
        use std::sync::atomic::Ordering::Relaxed;
        if success {
            self.created.fetch_add(1, Relaxed);
        } else {
            self.failed.fetch_add(1, Relaxed);
        }
        self.total_micros.fetch_add(elapsed.as_micros() as u64, Relaxed);
    }

    fn mark_validated(&self) {
        self.validated.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FactoryMetricsSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        let created = self.created.load(Relaxed);
        let failed = self.failed.load(Relaxed);
        let total = self.total_micros.load(Relaxed);
        let ops = created + failed;
        FactoryMetricsSnapshot {
            created,
            failed,
            validated: self.validated.load(Relaxed),
            avg_duration_micros: if ops == 0 { 0 } else { total / ops },
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FactoryMetricsSnapshot {
    pub created: u64,
    pub failed: u64,
    pub validated: u64,
    pub avg_duration_micros: u64,
}

/// A resource factory builds one or more related FHIR resource types from
/// a flat, human-shaped input object. Implementations provide `supports`
/// and `build`; `create` is the fixed template-method workflow (C4) that
/// wraps them with input validation, structural validation, and metadata.
pub trait ResourceFactory: Send + Sync {
    /// Name attached to `meta.factory` and used in metrics/logging.
    fn name(&self) -> &'static str;

    fn context(&self) -> &FactoryContext;

    fn metrics(&self) -> &FactoryMetrics;

    fn supports(&self, resource_type: &str) -> bool;

    /// Input-side keys the data object must contain for this resource type.
    /// These are semantic/flat keys, not FHIR field names.
    fn required_input_keys(&self, resource_type: &str) -> &'static [&'static str] {
        let _ = resource_type;
        &[]
    }

    /// Build the resource. Subclasses implement only this hook; `create`
    /// drives validation, metadata, and metrics around it.
    fn build(&self, resource_type: &str, data: &Value, request_id: Option<&str>) -> Result<Resource>;

    fn create(&self, resource_type: &str, data: &Value, request_id: Option<&str>) -> Result<Resource> {
        let start = Instant::now();
        let outcome = self.create_inner(resource_type, data, request_id);
        self.metrics().record(start.elapsed(), outcome.is_ok());
        match &outcome {
            Ok(resource) => tracing::info!(
                resource_type,
                request_id,
                factory = self.name(),
                duration_us = start.elapsed().as_micros() as u64,
                id = resource.id(),
                "created resource"
            ),
            Err(err) => tracing::warn!(resource_type, request_id, factory = self.name(), error = %err, "factory failed"),
        }
        outcome
    }

    fn create_inner(&self, resource_type: &str, data: &Value, request_id: Option<&str>) -> Result<Resource> {
        self.validate_input(resource_type, data)?;
        let mut resource = self.build(resource_type, data, request_id)?;
        self.validate_fhir_resource(&resource)?;
        self.add_metadata(&mut resource, request_id);
        Ok(resource)
    }

    fn validate_input(&self, resource_type: &str, data: &Value) -> Result<()> {
        let is_empty = match data {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        };
        if is_empty {
            return Err(Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: "input data cannot be empty".to_string(),
            });
        }
        if !self.supports(resource_type) {
            return Err(Error::FactoryInput {
                resource_type: resource_type.to_string(),
                message: format!("factory does not support resource type: {resource_type}"),
            });
        }
        for key in self.required_input_keys(resource_type) {
            let present = data.get(*key).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                return Err(Error::FactoryInput {
                    resource_type: resource_type.to_string(),
                    message: format!("required field '{key}' is missing for {resource_type}"),
                });
            }
        }
        Ok(())
    }

    fn validate_fhir_resource(&self, resource: &Resource) -> Result<()> {
        let result = self.context().validators.validate_resource(resource);
        if !result.valid {
            let messages: Vec<String> =
                result.issues.iter().map(|i| format!("{}: {}", i.path, i.message)).collect();
            return Err(Error::FhirStructural(messages.join("; ")));
        }
        self.metrics().mark_validated();
        Ok(())
    }

    fn add_metadata(&self, resource: &mut Resource, request_id: Option<&str>) {
        let mut meta = resource.get("meta").cloned().unwrap_or_else(|| Value::Object(Default::default()));
        meta["factory"] = Value::String(self.name().to_string());
        meta["createdAt"] = Value::String(chrono::Utc::now().to_rfc3339());
        meta["version"] = Value::String("1.0.0".to_string());
        if let Some(request_id) = request_id {
            meta["requestId"] = Value::String(request_id.to_string());
        }
        resource.set("meta", meta);

        if resource.id().is_none() {
            resource.set_id(generate_resource_id(resource.resource_type()));
        }
        self.context().references.cache_resource(resource);
    }

    /// Normalizes a bare id or `Type/id` string into a `{reference,
    /// display}` object, synthesizing `display` from the referenced
    /// resource if it has already been created in this pipeline run.
    fn reference_value(&self, raw: &str, default_type: &str) -> Value {
        self.context().references.reference_dict_for(raw, default_type, None)
    }
}

pub fn generate_resource_id(resource_type: &str) -> String {
    format!("{resource_type}-{}", uuid::Uuid::new_v4())
}

/// Pulls the first present key from `data` out of a list of accepted
/// aliases, e.g. `patient_id`/`patient_ref`/`subject` all meaning the same
/// Patient reference.
pub fn first_alias<'a>(data: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|key| data.get(*key)).filter(|v| !v.is_null())
}

pub fn first_alias_str<'a>(data: &'a Value, aliases: &[&str]) -> Option<&'a str> {
    first_alias(data, aliases).and_then(Value::as_str)
}
