//! `POST /fhir/optimize` (§6, C8): reference repair and other structural
//! fixups, plus a prediction of how likely the optimized bundle is to pass
//! server-side validation.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    pub bundle: Value,
    pub request_id: Option<String>,
}

/// Predicted success probability is the quality score clamped to the
/// spec's 95% ceiling: optimization can raise confidence, never certainty.
const PREDICTION_CEILING: f64 = 0.95;

pub async fn optimize(State(state): State<AppState>, Json(body): Json<OptimizeRequest>) -> Json<Value> {
    let optimized = state.quality_optimizer.optimize_bundle(&body.bundle, body.request_id.as_deref());

    let validation_result = state
        .fhir_client
        .validate_bundle(
            &optimized,
            body.request_id.as_deref(),
            &state.validator_registry,
            &state.performance_manager,
            &state.failover_manager,
        )
        .await;

    let analysis =
        state.quality_optimizer.analyze_validation_result(&validation_result, &optimized, body.request_id.as_deref());

    let predicted_success_probability = validation_result.bundle_quality_score.min(PREDICTION_CEILING);

    Json(json!({
        "bundle": optimized,
        "analysis": analysis,
        "predicted_success_probability": predicted_success_probability,
    }))
}
