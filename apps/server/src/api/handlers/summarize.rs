//! `POST /summarize-bundle` (§6): summarization itself is an out-of-scope
//! collaborator. This route only exists when `summarization_enabled` is
//! set; the handler supplies `summary_prep`-shaped data and otherwise
//! delegates to nothing, since the summarizer is external. When the
//! feature is off the route is not mounted at all (404).

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    pub bundle: Value,
    pub user_role: Option<String>,
}

pub async fn summarize_bundle(State(_state): State<AppState>, Json(body): Json<SummarizeRequest>) -> Json<Value> {
    let entry_count = body.bundle.get("entry").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
    Json(json!({
        "status": "accepted",
        "user_role": body.user_role,
        "bundle_metadata": {
            "bundle_id": body.bundle.get("id"),
            "bundle_type": body.bundle.get("type"),
            "entry_count": entry_count,
        },
        "summary": Value::Null,
    }))
}
