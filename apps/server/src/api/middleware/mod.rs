//! Middleware stack for the API (C14).

pub mod layers;
pub mod metrics;
pub mod rate_limit;
pub mod request_size;
pub mod security;
pub mod timing;

pub use layers::{compression, cors, trace};
pub use metrics::metrics_middleware;
pub use rate_limit::rate_limit_middleware;
pub use request_size::request_size_middleware;
pub use security::security_headers_middleware;
pub use timing::timing_middleware;
