//! Liveness/readiness probes (§6).

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "fhir-pipeline-server" }))
}

/// `/ready`, `/readiness`: healthy only once the external FHIR endpoint
/// pool meets the availability target (at least one non-`Down` endpoint).
pub async fn ready(State(state): State<AppState>) -> Json<Value> {
    let endpoints = state.failover_manager.endpoint_health();
    let ready = endpoints.iter().any(|e| !matches!(e.health, fhir_pipeline_models::EndpointHealth::Down));
    Json(json!({ "status": if ready { "ready" } else { "not_ready" }, "endpoints": endpoints }))
}

/// `/live`, `/liveness`: the process is up and able to answer at all.
pub async fn live() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}
