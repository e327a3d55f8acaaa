use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationIssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: ValidationIssueSeverity,
    /// Dotted path of the field the issue concerns, e.g. `entry[2].resource.subject`.
    pub path: String,
    pub message: String,
}

/// Where a `ValidationResult` came from: a fresh local structural pass, a
/// round trip to the external FHIR server, or the validation cache (C9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationSource {
    Local,
    Remote,
    Cache,
}

impl Default for ValidationSource {
    fn default() -> Self {
        ValidationSource::Local
    }
}

/// Outcome of validating a bundle, either structurally (C2) or against the
/// external FHIR server's `$validate` operation (C11).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    /// Weighted blend of structural pass, server no-errors, and per-resource
    /// completeness (§4.11): `0.3*structural + 0.5*server_clean + 0.2*completeness`.
    pub bundle_quality_score: f64,
    pub validation_source: ValidationSource,
    /// Human-readable outcome tag, e.g. `"passed"` / `"failed"`.
    pub validation_result: String,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            issues: Vec::new(),
            bundle_quality_score: 1.0,
            validation_source: ValidationSource::Local,
            validation_result: "passed".to_string(),
        }
    }

    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| matches!(i.severity, ValidationIssueSeverity::Error | ValidationIssueSeverity::Fatal))
            .count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| matches!(i.severity, ValidationIssueSeverity::Error | ValidationIssueSeverity::Fatal))
            .map(|i| i.message.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationIssueSeverity::Warning)
            .map(|i| i.message.clone())
            .collect()
    }

    pub fn information(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationIssueSeverity::Information)
            .map(|i| i.message.clone())
            .collect()
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.valid = self.valid && other.valid;
        self.issues.extend(other.issues);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Backup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointHealth {
    Healthy,
    Degraded,
    Down,
}

/// A single endpoint in the failover chain (C10).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub name: String,
    pub base_url: String,
    pub role: EndpointRole,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, role: EndpointRole) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            role,
            health: EndpointHealth::Healthy,
            consecutive_failures: 0,
        }
    }
}

/// One sample in the performance manager's bounded metrics ring buffer (C9).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformanceMetricRecord {
    pub operation: String,
    #[serde(with = "duration_as_millis")]
    pub duration: Duration,
    pub cache_hit: bool,
    pub success: bool,
}

mod duration_as_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    ResourceCreation,
    BundleAssembly,
    Validation,
    Execution,
    SummaryPrep,
}

/// Per-request bookkeeping accumulated across the orchestrator's five steps.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub processing_steps: Vec<String>,
    /// Seconds spent in each named step, e.g. `"resource_creation_time"`.
    pub performance_metrics: std::collections::HashMap<String, f64>,
    pub quality_scores: std::collections::HashMap<String, f64>,
    pub error_count: usize,
    pub warning_count: usize,
}

/// The orchestrator's (C13) output: what a caller of the pipeline receives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub request_id: String,
    pub success: bool,
    pub processing_metadata: ProcessingMetadata,
    pub input_entities: serde_json::Value,
    pub fhir_resources: Vec<serde_json::Value>,
    pub bundle: Option<serde_json::Value>,
    pub validation: Option<ValidationResult>,
    pub execution_response: Option<serde_json::Value>,
    pub quality_metrics: serde_json::Value,
    pub summary_prep: serde_json::Value,
    #[serde(with = "duration_as_millis")]
    pub total_duration: Duration,
    pub sla_violated: bool,
    pub failed_stage: Option<ProcessingStage>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProcessingResult {
    pub fn new(request_id: impl Into<String>, input_entities: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            processing_metadata: ProcessingMetadata::default(),
            input_entities,
            fhir_resources: Vec::new(),
            bundle: None,
            validation: None,
            execution_response: None,
            quality_metrics: serde_json::Value::Null,
            summary_prep: serde_json::Value::Null,
            total_duration: Duration::ZERO,
            sla_violated: false,
            failed_stage: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn failure(stage: ProcessingStage, error: String, elapsed: Duration) -> Self {
        let mut result = Self::new("unknown", serde_json::Value::Null);
        result.total_duration = elapsed;
        result.sla_violated = elapsed > Duration::from_secs(2);
        result.failed_stage = Some(stage);
        result.errors = vec![error];
        result
    }
}
