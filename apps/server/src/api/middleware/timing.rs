//! Timing + SLA middleware (C14): an 8-character request id, `X-Response-Time`
//! / `X-Request-ID` on every response, `X-SLA-Violation` plus a bounded
//! "recent violations" ring and per-endpoint counters when the handler
//! exceeds the SLA threshold.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;

use crate::state::AppState;

const VIOLATIONS_CAP: usize = 50;
const RESPONSE_TIME_SAMPLES_CAP: usize = 100;
const DEFAULT_SLA: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlaViolation {
    pub request_id: String,
    pub path: String,
    pub duration_ms: u128,
}

#[derive(Default)]
struct EndpointCounters {
    request_count: u64,
    error_count: u64,
    response_times_ms: VecDeque<f64>,
}

/// Process-wide SLA/timing tracker: one mutex for endpoint counters, one
/// for the bounded violations ring — short critical sections, per §5.
pub struct PerformanceTracker {
    sla: Duration,
    endpoints: Mutex<HashMap<String, EndpointCounters>>,
    violations: Mutex<VecDeque<SlaViolation>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::with_sla(DEFAULT_SLA)
    }

    pub fn with_sla(sla: Duration) -> Self {
        Self { sla, endpoints: Mutex::new(HashMap::new()), violations: Mutex::new(VecDeque::new()) }
    }

    fn record(&self, path: &str, duration: Duration, is_error: bool) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap();
        let counters = endpoints.entry(path.to_string()).or_default();
        counters.request_count += 1;
        if is_error {
            counters.error_count += 1;
        }
        counters.response_times_ms.push_back(duration.as_secs_f64() * 1000.0);
        if counters.response_times_ms.len() > RESPONSE_TIME_SAMPLES_CAP {
            counters.response_times_ms.pop_front();
        }
        duration > self.sla
    }

    fn record_violation(&self, violation: SlaViolation) {
        let mut violations = self.violations.lock().unwrap();
        violations.push_back(violation);
        if violations.len() > VIOLATIONS_CAP {
            violations.pop_front();
        }
    }

    pub fn recent_violations(&self) -> Vec<SlaViolation> {
        self.violations.lock().unwrap().iter().cloned().collect()
    }

    /// Per-endpoint request count, error count, average response time, and
    /// p95, plus the overall SLA compliance rate: `(total - violations) / total`.
    pub fn snapshot(&self) -> serde_json::Value {
        let endpoints = self.endpoints.lock().unwrap();
        let mut total_requests: u64 = 0;
        let mut per_endpoint = serde_json::Map::new();
        for (path, counters) in endpoints.iter() {
            total_requests += counters.request_count;
            let mut samples: Vec<f64> = counters.response_times_ms.iter().cloned().collect();
            samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let avg = if samples.is_empty() { 0.0 } else { samples.iter().sum::<f64>() / samples.len() as f64 };
            let p95 = percentile(&samples, 0.95);
            per_endpoint.insert(
                path.clone(),
                serde_json::json!({
                    "request_count": counters.request_count,
                    "error_count": counters.error_count,
                    "average_response_time_ms": avg,
                    "p95_response_time_ms": p95,
                }),
            );
        }
        let violations = self.violations.lock().unwrap().len() as u64;
        let compliance_rate =
            if total_requests == 0 { 1.0 } else { (total_requests.saturating_sub(violations)) as f64 / total_requests as f64 };

        serde_json::json!({
            "sla_threshold_seconds": self.sla.as_secs_f64(),
            "total_requests": total_requests,
            "sla_violations": violations,
            "compliance_rate": compliance_rate,
            "endpoints": per_endpoint,
        })
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted_samples: &[f64], p: f64) -> f64 {
    if sorted_samples.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted_samples.len() - 1) as f64).round() as usize;
    sorted_samples[rank.min(sorted_samples.len() - 1)]
}

fn generate_request_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

pub async fn timing_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let request_id = generate_request_id();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(req).await;
    let duration = start.elapsed();

    let is_error = response.status().is_client_error() || response.status().is_server_error();
    let sla_violated = state.performance_tracker.record(&path, duration, is_error);
    if sla_violated {
        tracing::warn!(request_id = %request_id, path = %path, duration_ms = duration.as_millis(), "SLA violation");
        state
            .performance_tracker
            .record_violation(SlaViolation { request_id: request_id.clone(), path: path.clone(), duration_ms: duration.as_millis() });
    }

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", duration.as_millis())) {
        headers.insert("x-response-time", value);
    }
    if sla_violated {
        headers.insert("x-sla-violation", HeaderValue::from_static("true"));
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_request_and_computes_compliance_rate() {
        let tracker = PerformanceTracker::with_sla(Duration::from_millis(1));
        assert!(!tracker.record("/fhir/pipeline", Duration::from_micros(1), false));
        assert!(tracker.record("/fhir/pipeline", Duration::from_millis(5), false));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot["total_requests"], 2);
        assert!(snapshot["compliance_rate"].as_f64().unwrap() < 1.0);
    }

    #[test]
    fn violations_ring_is_capped() {
        let tracker = PerformanceTracker::with_sla(Duration::from_nanos(1));
        for i in 0..(VIOLATIONS_CAP + 10) {
            tracker.record_violation(SlaViolation { request_id: format!("r{i}"), path: "/x".to_string(), duration_ms: 10 });
        }
        assert_eq!(tracker.recent_violations().len(), VIOLATIONS_CAP);
    }

    #[test]
    fn request_id_is_eight_characters() {
        let id = generate_request_id();
        assert_eq!(id.len(), 8);
    }
}
