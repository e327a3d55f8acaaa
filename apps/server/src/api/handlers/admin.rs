//! Admin/Status surface (C15 §4.15): read-only views aggregating C6/C8/C9/
//! C10/C11/C12, plus the cache-clear action.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /fhir/pipeline/status` — initialized flags, service statuses, success rate.
pub async fn pipeline_status(State(state): State<AppState>) -> Json<Value> {
    let registry_health = state.factory_registry.health_check();
    Json(json!({
        "initialized": true,
        "factory_registry": registry_health,
        "success_rate": state.quality_optimizer.get_validation_success_rate(),
        "endpoints": state.failover_manager.endpoint_health(),
        "meets_availability_target": state.failover_manager.meets_availability_target(),
    }))
}

/// `GET /fhir/quality/trends`.
pub async fn quality_trends(State(state): State<AppState>) -> Json<Value> {
    Json(state.quality_optimizer.get_quality_trends())
}

/// `GET /fhir/performance/metrics` — combines the rolling summary and the
/// five-minute real-time window.
pub async fn performance_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "summary": state.performance_manager.get_performance_summary(),
        "real_time": state.performance_manager.get_real_time_metrics(),
        "tuning": state.performance_manager.optimize_performance_settings(),
        "timing": state.performance_tracker.snapshot(),
    }))
}

/// `POST /fhir/performance/clear-cache`.
pub async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    Json(state.performance_manager.clear_caches())
}

/// `GET /fhir/status` — endpoint health plus failover event count.
pub async fn fhir_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "endpoints": state.failover_manager.endpoint_health(),
        "meets_availability_target": state.failover_manager.meets_availability_target(),
        "failover_events": state.failover_manager.failover_event_count(),
        "fhir_validation_enabled": state.config.fhir.fhir_validation_enabled,
    }))
}
