//! Prometheus metrics for the pipeline server.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL");

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "pipeline_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");

    /// In-flight HTTP requests
    pub static ref HTTP_REQUESTS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "pipeline_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
        &["method", "path"]
    )
    .expect("Failed to register HTTP_REQUESTS_IN_FLIGHT");

    /// Pipeline orchestration runs by outcome
    pub static ref PIPELINE_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_runs_total",
        "Total number of orchestrator pipeline runs",
        &["outcome"]
    )
    .expect("Failed to register PIPELINE_RUNS_TOTAL");

    /// Pipeline SLA violations
    pub static ref PIPELINE_SLA_VIOLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_sla_violations_total",
        "Total number of requests exceeding the processing SLA",
        &["stage"]
    )
    .expect("Failed to register PIPELINE_SLA_VIOLATIONS_TOTAL");

    /// Pipeline stage duration
    pub static ref PIPELINE_STAGE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "pipeline_stage_duration_seconds",
        "Duration of each orchestrator stage in seconds",
        &["stage"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
    )
    .expect("Failed to register PIPELINE_STAGE_DURATION_SECONDS");

    /// Cache hit/miss counts per cache
    pub static ref CACHE_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_cache_requests_total",
        "Total cache lookups by cache name and outcome (hit/miss)",
        &["cache", "outcome"]
    )
    .expect("Failed to register CACHE_REQUESTS_TOTAL");

    /// Current cache size
    pub static ref CACHE_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "pipeline_cache_size",
        "Current number of entries in a cache",
        &["cache"]
    )
    .expect("Failed to register CACHE_SIZE");

    /// Rate limiter rejections
    pub static ref RATE_LIMIT_REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_rate_limit_rejections_total",
        "Total number of requests rejected by the rate limiter",
        &["client"]
    )
    .expect("Failed to register RATE_LIMIT_REJECTIONS_TOTAL");

    /// Failover endpoint health transitions
    pub static ref FAILOVER_ENDPOINT_HEALTH: IntGaugeVec = register_int_gauge_vec!(
        "pipeline_failover_endpoint_health",
        "Health of a failover endpoint (1=healthy, 0=down)",
        &["endpoint"]
    )
    .expect("Failed to register FAILOVER_ENDPOINT_HEALTH");

    /// FHIR resources created by type
    pub static ref RESOURCES_CREATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_resources_created_total",
        "Total number of FHIR resources created by factories",
        &["resource_type", "outcome"]
    )
    .expect("Failed to register RESOURCES_CREATED_TOTAL");

    /// Active requests gauge
    pub static ref ACTIVE_REQUESTS: IntGauge = register_int_gauge!(
        "pipeline_active_requests",
        "Number of pipeline requests currently in flight"
    )
    .expect("Failed to register ACTIVE_REQUESTS");
}

pub fn sanitize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments[0])
}
