//! `POST /execute` (§6, C12): executes a caller-supplied bundle directly.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub fhir_bundle: Value,
    pub request_id: Option<String>,
    #[serde(default = "default_true")]
    pub validate_first: bool,
    #[serde(default)]
    pub force_execution: bool,
}

fn default_true() -> bool {
    true
}

pub async fn execute(State(state): State<AppState>, Json(body): Json<ExecuteRequest>) -> Json<Value> {
    let (outcome, pre_validation) = state
        .fhir_client
        .execute_bundle(
            &body.fhir_bundle,
            body.request_id.as_deref(),
            body.validate_first,
            body.force_execution,
            &state.validator_registry,
            &state.performance_manager,
            &state.failover_manager,
        )
        .await;

    Json(json!({
        "execution": outcome,
        "pre_validation": pre_validation,
    }))
}
