//! `POST /validate` (§6, C11): validates a caller-supplied bundle directly,
//! bypassing resource creation and bundle assembly.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub fhir_bundle: Value,
    pub request_id: Option<String>,
}

pub async fn validate(State(state): State<AppState>, Json(body): Json<ValidateRequest>) -> Json<Value> {
    let result = state
        .fhir_client
        .validate_bundle(
            &body.fhir_bundle,
            body.request_id.as_deref(),
            &state.validator_registry,
            &state.performance_manager,
            &state.failover_manager,
        )
        .await;
    Json(serde_json::to_value(result).unwrap_or(Value::Null))
}
