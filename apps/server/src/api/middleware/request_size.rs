//! Request-size guard (C14 §4.14): reject any request whose declared
//! `Content-Length` exceeds the configured ceiling (default 1 MiB) with a
//! structured 413 before it reaches a handler.

use axum::{extract::Request, middleware::Next, response::Response, response::IntoResponse};

use crate::error::Error;
use crate::state::AppState;

pub async fn request_size_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let limit = state.config.performance.max_request_size_bytes();
    let content_length = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if content_length.map(|length| length > limit).unwrap_or(false) {
        return Error::PayloadTooLarge.into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn default_limit_is_one_mebibyte() {
        let config = Config::default();
        assert_eq!(config.performance.max_request_size_bytes(), 1024 * 1024);
    }
}
