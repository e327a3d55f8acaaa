//! End-to-end HTTP tests against the real router (no mocks): health/ready/
//! metrics surfaces and the orchestrated `/fhir/pipeline` path.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fhir_pipeline_server::{api::create_router, config::Config, state::AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_app() -> axum::Router {
    let config = Config::default();
    let state = AppState::new(config).expect("AppState::new should succeed with default config");
    create_router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = test_app();
    let response =
        app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn liveness_endpoint_reports_alive() {
    let app = test_app();
    let response =
        app.oneshot(Request::builder().uri("/live").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_returns_prometheus_text() {
    let app = test_app();
    let response =
        app.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn pipeline_endpoint_builds_bundle_from_entities_without_network_validation() {
    let app = test_app();
    let entities = json!({
        "nlp_entities": {
            "patient_info": { "age": "52", "gender": "female", "patient_ref": "patient-1" },
            "medications": [
                { "name": "Metformin", "dosage": "500mg", "frequency": "twice daily", "rxnorm_code": "860975" }
            ]
        },
        "validate_bundle": false,
        "execute_bundle": false
    });

    let request = Request::builder()
        .method("POST")
        .uri("/fhir/pipeline")
        .header("content-type", "application/json")
        .body(Body::from(entities.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert!(body["fhir_resources"].as_array().unwrap().len() >= 2);
    assert!(body["bundle"]["entry"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn summarize_bundle_route_is_not_mounted_by_default() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/summarize-bundle")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "bundle": {} }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_request_is_rejected_with_413() {
    let app = test_app();
    let oversized = "a".repeat(1024 * 1024 + 1);
    let request = Request::builder()
        .method("POST")
        .uri("/fhir/pipeline")
        .header("content-type", "application/json")
        .header("content-length", oversized.len().to_string())
        .body(Body::from(oversized))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
