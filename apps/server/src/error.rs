//! Error taxonomy for the pipeline server.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The HTTP request body failed schema/shape validation before any
    /// factory ran (e.g. missing `entities`, unknown entity `resourceType`).
    #[error("input validation error: {0}")]
    InputValidation(String),

    /// A factory could not build a resource from the given entity data
    /// (missing a field the factory requires, an out-of-range value).
    #[error("factory input error for {resource_type}: {message}")]
    FactoryInput { resource_type: String, message: String },

    /// The assembled bundle failed structural FHIR R4 validation (C2).
    #[error("FHIR structural validation error: {0}")]
    FhirStructural(String),

    /// The external FHIR server rejected or could not be reached for
    /// validation/execution (C11/C12), after retries and failover were
    /// exhausted.
    #[error("external FHIR server error: {0}")]
    ExternalServer(String),

    /// The rate limiter (C14) rejected this request.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    QuotaExceeded { retry_after_secs: u64 },

    /// The request body exceeded the configured size limit (C14).
    #[error("request payload too large")]
    PayloadTooLarge,

    /// Anything else: config load failure, poisoned lock, unexpected
    /// invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match &self {
            Error::InputValidation(_) => (StatusCode::BAD_REQUEST, self.to_string(), None),
            Error::FactoryInput { .. } => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string(), None),
            Error::FhirStructural(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string(), None),
            Error::ExternalServer(_) => (StatusCode::BAD_GATEWAY, self.to_string(), None),
            Error::QuotaExceeded { retry_after_secs } => {
                (StatusCode::TOO_MANY_REQUESTS, self.to_string(), Some(*retry_after_secs))
            }
            Error::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string(), None),
            Error::Internal(_) | Error::Other(_) => {
                tracing::error!("internal error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string(), None)
            }
        };

        let body = Json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "error",
                "code": status_to_fhir_code(status),
                "diagnostics": message
            }]
        }));

        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/fhir+json; charset=utf-8"),
        );
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn status_to_fhir_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid",
        StatusCode::UNPROCESSABLE_ENTITY => "processing",
        StatusCode::BAD_GATEWAY => "transient",
        StatusCode::TOO_MANY_REQUESTS => "throttled",
        StatusCode::PAYLOAD_TOO_LARGE => "too-long",
        _ => "exception",
    }
}
