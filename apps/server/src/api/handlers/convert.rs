//! NLP-entities ingestion boundary (§6: `/convert`, `/api/v1/convert`,
//! `/api/v1/bulk-convert`). The upstream NLP extraction collaborator is out
//! of scope; these handlers validate the shape of what it would hand us and
//! forward straight into the pipeline orchestrator.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use crate::error::{Error, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct ConvertRequest {
    #[validate(length(min = 5, max = 5000))]
    pub clinical_text: String,
    #[validate(regex(path = "PATIENT_REF_PATTERN"))]
    pub patient_ref: Option<String>,
}

lazy_static::lazy_static! {
    static ref PATIENT_REF_PATTERN: regex::Regex =
        regex::Regex::new(r"^[A-Za-z0-9\-_/]{0,100}$").expect("patient_ref pattern is valid");
}

/// `POST /convert` — the minimal form. Entity extraction itself is not this
/// service's job, so the response only confirms the request was accepted.
pub async fn convert(Json(body): Json<ConvertRequest>) -> Result<Json<Value>> {
    body.validate().map_err(|e| Error::InputValidation(e.to_string()))?;
    let request_id = format!("req-{}", uuid::Uuid::new_v4());
    Ok(Json(json!({
        "status": "accepted",
        "request_id": request_id,
        "clinical_text_length": body.clinical_text.len(),
        "patient_ref": body.patient_ref,
    })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExtendedConvertRequest {
    #[validate(length(min = 5, max = 5000))]
    pub clinical_text: String,
    #[validate(regex(path = "PATIENT_REF_PATTERN"))]
    pub patient_ref: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub ordering_provider: Option<String>,
    pub department: Option<String>,
    #[serde(default)]
    pub context_metadata: Value,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Routine,
    Urgent,
    Stat,
    Asap,
}

/// `POST /api/v1/convert` — same acceptance contract, richer echo-back of
/// the extended fields entity extraction would eventually consume.
pub async fn convert_v1(Json(body): Json<ExtendedConvertRequest>) -> Result<Json<Value>> {
    body.validate().map_err(|e| Error::InputValidation(e.to_string()))?;
    let request_id = format!("req-{}", uuid::Uuid::new_v4());
    Ok(Json(json!({
        "status": "accepted",
        "request_id": request_id,
        "priority": body.priority,
        "ordering_provider": body.ordering_provider,
        "department": body.department,
        "context_metadata": body.context_metadata,
        "entity_extraction": Value::Null,
        "structured_output": Value::Null,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BulkConvertRequest {
    pub orders: Vec<ExtendedConvertRequest>,
    pub batch_id: Option<String>,
    #[serde(default)]
    pub processing_options: Value,
}

/// `POST /api/v1/bulk-convert` — `orders` must contain 1..50 entries.
pub async fn bulk_convert(
    State(_state): State<AppState>,
    Json(body): Json<BulkConvertRequest>,
) -> Result<Json<Value>> {
    if body.orders.is_empty() || body.orders.len() > 50 {
        return Err(Error::InputValidation("orders must contain between 1 and 50 entries".to_string()));
    }

    let batch_id = body.batch_id.unwrap_or_else(|| format!("batch-{}", uuid::Uuid::new_v4()));
    let mut results = Vec::with_capacity(body.orders.len());
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    for order in &body.orders {
        match order.validate() {
            Ok(()) => {
                accepted += 1;
                results.push(json!({
                    "status": "accepted",
                    "request_id": format!("req-{}", uuid::Uuid::new_v4()),
                    "priority": order.priority,
                }));
            }
            Err(e) => {
                rejected += 1;
                results.push(json!({ "status": "rejected", "error": e.to_string() }));
            }
        }
    }

    Ok(Json(json!({
        "batch_id": batch_id,
        "processing_options": body.processing_options,
        "results": results,
        "summary": { "total": results.len(), "accepted": accepted, "rejected": rejected },
    })))
}
