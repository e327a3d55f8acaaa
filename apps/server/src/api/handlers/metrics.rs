//! `GET /metrics`: Prometheus text-format exposition.

use axum::{http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (StatusCode::OK, [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")], buffer),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, [("Content-Type", "text/plain")], b"failed to encode metrics".to_vec())
        }
    }
}
