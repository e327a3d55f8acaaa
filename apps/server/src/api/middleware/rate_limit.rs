//! Sliding-window rate limiter (C14): one mutex around the whole per-key
//! timestamp-deque map, which the spec calls "simple, adequate at 100 rps".

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::Error;
use crate::state::AppState;

/// Per-client-key sliding window of admission timestamps.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests_per_minute: u32, window_seconds: u64) -> Self {
        Self {
            max_requests: max_requests_per_minute,
            window: Duration::from_secs(window_seconds),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admits `key`'s request, pruning timestamps older than the window.
    /// Returns `Ok(())` if admitted, `Err(retry_after_secs)` if over quota.
    pub fn admit(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let deque = windows.entry(key.to_string()).or_default();
        while let Some(front) = deque.front() {
            if now.duration_since(*front) > self.window {
                deque.pop_front();
            } else {
                break;
            }
        }

        if deque.len() as u32 >= self.max_requests {
            let retry_after = deque
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after.as_secs().max(1));
        }

        deque.push_back(now);
        Ok(())
    }
}

/// First entry of `x-forwarded-for`, else the socket peer, else `anonymous`.
fn client_key(req: &Request) -> String {
    if let Some(forwarded) = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return addr.ip().to_string();
    }
    "anonymous".to_string()
}

pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let key = client_key(&req);
    match state.rate_limiter.admit(&key) {
        Ok(()) => next.run(req).await,
        Err(retry_after_secs) => {
            crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&[&key]).inc();
            Error::QuotaExceeded { retry_after_secs }.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_configured_limit() {
        let limiter = RateLimiter::new(3, 60);
        assert!(limiter.admit("client-a").is_ok());
        assert!(limiter.admit("client-a").is_ok());
        assert!(limiter.admit("client-a").is_ok());
        assert!(limiter.admit("client-a").is_err());
    }

    #[test]
    fn separate_keys_have_independent_windows() {
        let limiter = RateLimiter::new(1, 60);
        assert!(limiter.admit("client-a").is_ok());
        assert!(limiter.admit("client-b").is_ok());
        assert!(limiter.admit("client-a").is_err());
    }

    #[test]
    fn expired_window_entries_are_pruned() {
        let limiter = RateLimiter::new(1, 0);
        assert!(limiter.admit("client-a").is_ok());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.admit("client-a").is_ok());
    }
}
