//! `POST /fhir/pipeline` (§6, C13): the orchestrated entity-to-bundle path.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PipelineRequest {
    pub nlp_entities: Value,
    #[serde(default = "default_true")]
    pub validate_bundle: bool,
    #[serde(default)]
    pub execute_bundle: bool,
    pub request_id: Option<String>,
}

fn default_true() -> bool {
    true
}

pub async fn run_pipeline(State(state): State<AppState>, Json(body): Json<PipelineRequest>) -> Json<Value> {
    let result = state
        .orchestrator
        .process(body.nlp_entities, body.validate_bundle, body.execute_bundle, body.request_id)
        .await;
    Json(serde_json::to_value(result).unwrap_or(Value::Null))
}
