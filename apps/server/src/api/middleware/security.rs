//! Security headers middleware (C14 §4.14).

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

use crate::state::AppState;

/// Appends a fixed set of security headers to every response. Not a
/// replacement for authentication/authorization, just a safe baseline.
pub async fn security_headers_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let is_https = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
        || req.uri().scheme_str().map(|s| s.eq_ignore_ascii_case("https")).unwrap_or(false);

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert("cache-control", HeaderValue::from_static("no-store, no-cache, must-revalidate"));
    headers.insert("referrer-policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers.insert("content-security-policy", HeaderValue::from_static("default-src 'none'"));

    if is_https && state.config.server.is_production() {
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
        );
    }

    response
}
