//! Validation Service (C11) and Execution Service (C12): talks HL7 FHIR R4
//! JSON to the external FHIR server, with caching, retries, and failover
//! composed in from the collaborators passed to each call.

use std::time::Duration;

use fhir_pipeline_models::{ValidationIssue, ValidationIssueSeverity, ValidationResult, ValidationSource};
use fhir_pipeline_validator::ValidatorRegistry;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::failover::FailoverManager;
use crate::perf::PerformanceManager;

/// Outcome of one bundle entry inside a transaction-response Bundle.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionEntryOutcome {
    pub status: String,
    pub location: Option<String>,
    pub issues: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionOutcome {
    pub executed: bool,
    pub entries: Vec<ExecutionEntryOutcome>,
    pub refused_reason: Option<String>,
}

/// Thin HTTP transport plus retry/backoff policy; the caller (the
/// orchestrator) supplies the collaborators (C2, C9, C10) a real
/// validation/execution pass needs.
pub struct FhirClient {
    http: reqwest::Client,
    max_retries: u32,
}

impl FhirClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fhir.hapi_fhir_timeout_seconds))
            .build()?;
        Ok(Self { http, max_retries: config.pipeline.max_retries.max(1) })
    }

    /// §4.11: cache check, local structural pass, remote `$validate` with
    /// retry/failover, weighted quality score, cache the result.
    pub async fn validate_bundle(
        &self,
        bundle: &Value,
        request_id: Option<&str>,
        validators: &ValidatorRegistry,
        performance: &PerformanceManager,
        failover: &FailoverManager,
    ) -> ValidationResult {
        let digest = performance.generate_bundle_hash(bundle);
        if let Some(cached) = performance.get_cached_validation(&digest) {
            if let Ok(mut result) = serde_json::from_value::<ValidationResult>(cached) {
                result.validation_source = ValidationSource::Cache;
                return result;
            }
        }

        let typed_bundle: fhir_pipeline_models::Bundle = match serde_json::from_value(bundle.clone()) {
            Ok(b) => b,
            Err(err) => {
                return ValidationResult {
                    valid: false,
                    issues: vec![ValidationIssue {
                        severity: ValidationIssueSeverity::Fatal,
                        path: "$".to_string(),
                        message: format!("bundle does not parse as a FHIR Bundle: {err}"),
                    }],
                    bundle_quality_score: 0.0,
                    validation_source: ValidationSource::Local,
                    validation_result: "failed".to_string(),
                }
            }
        };

        let local = validators.validate_bundle(&typed_bundle);
        if !local.valid {
            tracing::info!(request_id, structural_errors = local.error_count(), "bundle failed local structural validation");
            return local;
        }

        let mut last_issues = Vec::new();
        let mut server_clean = false;
        for attempt in 0..self.max_retries {
            let endpoint = failover.get_active_endpoint();
            let timeout = performance.request_timeout();
            let url = format!("{}/Bundle/$validate", endpoint.base_url.trim_end_matches('/'));

            match self.post_fhir_json(&url, bundle, timeout).await {
                Ok(response) => {
                    failover.record_success(&endpoint.name);
                    last_issues = operation_outcome_issues(&response);
                    server_clean = !last_issues.iter().any(|i| i.severity == ValidationIssueSeverity::Error || i.severity == ValidationIssueSeverity::Fatal);
                    break;
                }
                Err(err) => {
                    failover.record_failure(&endpoint.name);
                    tracing::warn!(request_id, attempt, error = %err, "bundle validation attempt failed");
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }

        let completeness = average_completeness(bundle);
        let structural_component = 0.3;
        let server_component = if server_clean { 0.5 } else { 0.0 };
        let completeness_component = 0.2 * completeness;
        let bundle_quality_score = structural_component + server_component + completeness_component;

        let valid = local.valid && server_clean;
        let result = ValidationResult {
            valid,
            issues: last_issues,
            bundle_quality_score,
            validation_source: ValidationSource::Remote,
            validation_result: if valid { "passed".to_string() } else { "failed".to_string() },
        };

        if let Ok(cacheable) = serde_json::to_value(&result) {
            performance.cache_validation(digest, cacheable);
        }
        result
    }

    /// §4.12: optional pre-validation, POST the transaction, per-entry outcomes.
    pub async fn execute_bundle(
        &self,
        bundle: &Value,
        request_id: Option<&str>,
        validate_first: bool,
        force_execution: bool,
        validators: &ValidatorRegistry,
        performance: &PerformanceManager,
        failover: &FailoverManager,
    ) -> (ExecutionOutcome, Option<ValidationResult>) {
        let mut pre_validation = None;
        if validate_first {
            let result = self.validate_bundle(bundle, request_id, validators, performance, failover).await;
            if !result.valid && !force_execution {
                let reason = "bundle failed validation and force_execution was not set".to_string();
                pre_validation = Some(result);
                return (ExecutionOutcome { executed: false, entries: Vec::new(), refused_reason: Some(reason) }, pre_validation);
            }
            pre_validation = Some(result);
        } else {
            let local = match serde_json::from_value::<fhir_pipeline_models::Bundle>(bundle.clone()) {
                Ok(typed_bundle) => validators.validate_bundle(&typed_bundle),
                Err(err) => ValidationResult {
                    valid: false,
                    issues: vec![ValidationIssue {
                        severity: ValidationIssueSeverity::Fatal,
                        path: "$".to_string(),
                        message: format!("bundle does not parse as a FHIR Bundle: {err}"),
                    }],
                    bundle_quality_score: 0.0,
                    validation_source: ValidationSource::Local,
                    validation_result: "failed".to_string(),
                },
            };
            if !local.valid && !force_execution {
                tracing::info!(request_id, structural_errors = local.error_count(), "bundle failed local structural validation before execution");
                let reason = "bundle failed local structural validation and force_execution was not set".to_string();
                return (ExecutionOutcome { executed: false, entries: Vec::new(), refused_reason: Some(reason) }, Some(local));
            }
            pre_validation = Some(local);
        }

        for attempt in 0..self.max_retries {
            let endpoint = failover.get_active_endpoint();
            let timeout = performance.request_timeout();
            let url = endpoint.base_url.trim_end_matches('/').to_string();

            match self.post_fhir_json(&url, bundle, timeout).await {
                Ok(response) => {
                    failover.record_success(&endpoint.name);
                    let entries = transaction_response_entries(&response);
                    return (ExecutionOutcome { executed: true, entries, refused_reason: None }, pre_validation);
                }
                Err(err) => {
                    failover.record_failure(&endpoint.name);
                    tracing::warn!(request_id, attempt, error = %err, "bundle execution attempt failed");
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }

        (
            ExecutionOutcome {
                executed: false,
                entries: Vec::new(),
                refused_reason: Some("external FHIR server unreachable after retries".to_string()),
            },
            pre_validation,
        )
    }

    async fn post_fhir_json(&self, url: &str, body: &Value, timeout: Duration) -> anyhow::Result<Value> {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/fhir+json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            anyhow::bail!("external FHIR server returned {status}");
        }
        Ok(payload)
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(250 * 2u64.pow(attempt))
}

fn operation_outcome_issues(outcome: &Value) -> Vec<ValidationIssue> {
    let Some(issues) = outcome.get("issue").and_then(Value::as_array) else { return Vec::new() };
    issues
        .iter()
        .map(|issue| {
            let severity = match issue.get("severity").and_then(Value::as_str) {
                Some("fatal") => ValidationIssueSeverity::Fatal,
                Some("warning") => ValidationIssueSeverity::Warning,
                Some("information") => ValidationIssueSeverity::Information,
                _ => ValidationIssueSeverity::Error,
            };
            ValidationIssue {
                severity,
                path: issue
                    .get("expression")
                    .and_then(Value::as_array)
                    .and_then(|a| a.first())
                    .and_then(Value::as_str)
                    .unwrap_or("$")
                    .to_string(),
                message: issue.get("diagnostics").and_then(Value::as_str).unwrap_or("validation issue").to_string(),
            }
        })
        .collect()
}

fn transaction_response_entries(response: &Value) -> Vec<ExecutionEntryOutcome> {
    let Some(entries) = response.get("entry").and_then(Value::as_array) else { return Vec::new() };
    entries
        .iter()
        .map(|entry| {
            let response_part = entry.get("response");
            let status = response_part
                .and_then(|r| r.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let location = response_part.and_then(|r| r.get("location")).and_then(Value::as_str).map(str::to_string);
            let issues = entry
                .get("resource")
                .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some("OperationOutcome"))
                .map(operation_outcome_issues)
                .unwrap_or_default()
                .into_iter()
                .map(|i| i.message)
                .collect();
            ExecutionEntryOutcome { status, location, issues }
        })
        .collect()
}

/// Rough per-resource completeness average: a resource with an `id` and
/// more than the bare `resourceType`/`id` pair counts as complete.
fn average_completeness(bundle: &Value) -> f64 {
    let Some(entries) = bundle.get("entry").and_then(Value::as_array) else { return 0.0 };
    if entries.is_empty() {
        return 0.0;
    }
    let total: f64 = entries
        .iter()
        .map(|entry| {
            let Some(resource) = entry.get("resource").and_then(Value::as_object) else { return 0.0 };
            let has_id = resource.contains_key("id");
            let field_count = resource.len();
            match (has_id, field_count) {
                (true, n) if n > 4 => 1.0,
                (true, _) => 0.6,
                (false, _) => 0.2,
            }
        })
        .sum();
    total / entries.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completeness_rewards_richer_resources() {
        let bundle = json!({
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "p1", "active": true, "name": [], "gender": "female" } },
                { "resource": { "resourceType": "Condition", "id": "c1" } },
            ]
        });
        let score = average_completeness(&bundle);
        assert!(score > 0.6 && score < 1.0);
    }

    #[test]
    fn completeness_is_zero_for_empty_bundle() {
        assert_eq!(average_completeness(&json!({ "entry": [] })), 0.0);
    }

    #[test]
    fn operation_outcome_with_no_issues_parses_empty() {
        assert!(operation_outcome_issues(&json!({})).is_empty());
    }

    #[test]
    fn operation_outcome_issue_severity_is_mapped() {
        let outcome = json!({ "issue": [{ "severity": "warning", "diagnostics": "check code binding" }] });
        let issues = operation_outcome_issues(&outcome);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ValidationIssueSeverity::Warning);
    }

    #[test]
    fn transaction_response_entries_extracts_status_and_location() {
        let response = json!({
            "entry": [{ "response": { "status": "201 Created", "location": "Patient/p1/_history/1" } }]
        });
        let entries = transaction_response_entries(&response);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, "201 Created");
        assert_eq!(entries[0].location.as_deref(), Some("Patient/p1/_history/1"));
    }
}
