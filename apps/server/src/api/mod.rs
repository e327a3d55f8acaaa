//! API layer - handlers, middleware, and router assembly (§6).

pub mod handlers;
pub mod middleware;

use axum::{
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::state::AppState;

/// Builds the full application router, wiring every route named in §6 onto
/// its handler and stacking the C14 middleware in request order: security
/// headers and request-size guard first (cheapest, short-circuit before
/// anything else runs), then rate limiting, then timing/SLA, then metrics.
pub fn create_router(state: AppState) -> Router {
    let cors_origins = state.config.security.cors_origins.clone();
    let summarization_enabled = state.config.pipeline.summarization_enabled;

    let mut router = Router::new()
        .route("/convert", post(handlers::convert::convert))
        .route("/api/v1/convert", post(handlers::convert::convert_v1))
        .route("/api/v1/bulk-convert", post(handlers::convert::bulk_convert))
        .route("/fhir/pipeline", post(handlers::pipeline::run_pipeline))
        .route("/fhir/pipeline/status", get(handlers::admin::pipeline_status))
        .route("/fhir/optimize", post(handlers::optimize::optimize))
        .route("/fhir/quality/trends", get(handlers::admin::quality_trends))
        .route("/fhir/performance/metrics", get(handlers::admin::performance_metrics))
        .route("/fhir/performance/clear-cache", post(handlers::admin::clear_cache))
        .route("/fhir/status", get(handlers::admin::fhir_status))
        .route("/validate", post(handlers::validate::validate))
        .route("/execute", post(handlers::execute::execute))
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/readiness", get(handlers::health::ready))
        .route("/live", get(handlers::health::live))
        .route("/liveness", get(handlers::health::live))
        .route("/metrics", get(handlers::metrics::metrics_handler))
        .route("/", get(root));

    // §6: summarization is an external collaborator; the route only exists
    // when the feature flag is on, otherwise it 404s like any unknown path.
    if summarization_enabled {
        router = router.route("/summarize-bundle", post(handlers::summarize::summarize_bundle));
    }

    router
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::metrics_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::timing_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::security_headers_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::request_size_middleware))
        .layer(middleware::compression())
        .layer(middleware::cors(&cors_origins))
        .layer(middleware::trace())
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "server": "fhir-pipeline-server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}
