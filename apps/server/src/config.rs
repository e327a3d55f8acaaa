//! Process configuration.
//!
//! Loaded once at startup from environment variables (optionally via a
//! `.env` file), using flat, per-field names rather than a nested
//! `SECTION__KEY` scheme, since those are the names operators already use.

use serde::Deserialize;
use std::net::SocketAddr;

fn default_app_name() -> String {
    "fhir-pipeline".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_request_size_mb() -> u64 {
    1
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_rate_limit_requests_per_minute() -> u32 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "human".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_hapi_fhir_url() -> String {
    "http://localhost:8080/fhir".to_string()
}
fn default_hapi_fhir_timeout_seconds() -> u64 {
    10
}
fn default_fhir_version() -> String {
    "R4".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_concurrent_requests() -> usize {
    10
}
fn default_sla_seconds() -> f64 {
    2.0
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_cache_ttl_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_max_request_size_mb")]
    pub max_request_size_mb: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_rate_limit_requests_per_minute")]
    pub rate_limit_requests_per_minute: u32,
}

impl PerformanceConfig {
    pub fn max_request_size_bytes(&self) -> u64 {
        self.max_request_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_version: Option<String>,
    #[serde(default)]
    pub deployment_environment: String,
    #[serde(default)]
    pub opentelemetry_enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_otlp_timeout_seconds")]
    pub otlp_timeout_seconds: u64,
    #[serde(default = "default_trace_sample_ratio")]
    pub trace_sample_ratio: f64,
    #[serde(default)]
    pub file_enabled: bool,
    #[serde(default = "default_file_directory")]
    pub file_directory: String,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_file_rotation")]
    pub file_rotation: String,
}

impl LoggingConfig {
    pub fn json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}
fn default_otlp_timeout_seconds() -> u64 {
    5
}
fn default_trace_sample_ratio() -> f64 {
    1.0
}
fn default_file_directory() -> String {
    "logs".to_string()
}
fn default_file_prefix() -> String {
    "fhir-pipeline".to_string()
}
fn default_file_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default = "default_true")]
    pub enable_health_check: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FhirConfig {
    #[serde(default = "default_hapi_fhir_url")]
    pub hapi_fhir_url: String,
    #[serde(default)]
    pub hapi_fhir_backup_url: Option<String>,
    #[serde(default = "default_hapi_fhir_timeout_seconds")]
    pub hapi_fhir_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub fhir_validation_enabled: bool,
    #[serde(default = "default_fhir_version")]
    pub fhir_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_sla_seconds")]
    pub sla_seconds: f64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Per Open Question #4: when true, a missing ImagingStudy series
    /// instance UID is a `FactoryInputError` instead of being auto-minted.
    #[serde(default)]
    pub imaging_reject_synthesized_series_uid: bool,
    /// Gates the medication-allergy cross-reactivity check in the
    /// medication factory family.
    #[serde(default = "default_true")]
    pub safety_validation_enabled: bool,
    /// Gates the `/summarize-bundle` endpoint; summarization itself is an
    /// out-of-scope collaborator, so this only controls whether the route
    /// exists or answers 404.
    #[serde(default)]
    pub summarization_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub fhir: FhirConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            debug: false,
            host: default_host(),
            port: default_port(),
        }
    }
}
impl Default for SecurityConfig {
    fn default() -> Self {
        Self { cors_origins: Vec::new(), allowed_hosts: Vec::new() }
    }
}
impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_request_size_mb: default_max_request_size_mb(),
            request_timeout_seconds: default_request_timeout_seconds(),
            rate_limit_requests_per_minute: default_rate_limit_requests_per_minute(),
        }
    }
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            service_name: default_app_name(),
            service_version: None,
            deployment_environment: default_environment(),
            opentelemetry_enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            otlp_timeout_seconds: default_otlp_timeout_seconds(),
            trace_sample_ratio: default_trace_sample_ratio(),
            file_enabled: false,
            file_directory: default_file_directory(),
            file_prefix: default_file_prefix(),
            file_rotation: default_file_rotation(),
        }
    }
}
impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { enable_metrics: true, enable_health_check: true, metrics_port: default_metrics_port() }
    }
}
impl Default for FhirConfig {
    fn default() -> Self {
        Self {
            hapi_fhir_url: default_hapi_fhir_url(),
            hapi_fhir_backup_url: None,
            hapi_fhir_timeout_seconds: default_hapi_fhir_timeout_seconds(),
            fhir_validation_enabled: true,
            fhir_version: default_fhir_version(),
        }
    }
}
impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_concurrent_requests: default_max_concurrent_requests(),
            sla_seconds: default_sla_seconds(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            imaging_reject_synthesized_series_uid: false,
            safety_validation_enabled: true,
            summarization_enabled: false,
        }
    }
}

impl Config {
    /// Load configuration from (in increasing precedence) built-in
    /// defaults, an optional `config.toml`, a `.env` file, and the process
    /// environment. Env vars use the flat names listed in each field's
    /// `#[serde(default = ...)]` counterpart, e.g. `APP_NAME`,
    /// `HAPI_FHIR_URL`, `RATE_LIMIT_REQUESTS_PER_MINUTE`.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder().add_source(config::File::with_name("config").required(false));
        for (key, value) in Self::flat_env_map() {
            builder = builder.set_override(key, value)?;
        }

        let raw: config::Config = builder.build()?;
        let config: Config = raw.try_deserialize().unwrap_or_default();
        Ok(config)
    }

    /// Maps the flat, per-field env var names used by this service onto the
    /// nested keys `config::Config` expects, so `server.port`, say, is
    /// reachable from `PORT` rather than requiring `SERVER__PORT`.
    fn flat_env_map() -> std::collections::HashMap<String, String> {
        let mappings: &[(&str, &str)] = &[
            ("APP_NAME", "server.app_name"),
            ("ENVIRONMENT", "server.environment"),
            ("DEBUG", "server.debug"),
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("CORS_ORIGINS", "security.cors_origins"),
            ("ALLOWED_HOSTS", "security.allowed_hosts"),
            ("MAX_REQUEST_SIZE_MB", "performance.max_request_size_mb"),
            ("REQUEST_TIMEOUT_SECONDS", "performance.request_timeout_seconds"),
            ("RATE_LIMIT_REQUESTS_PER_MINUTE", "performance.rate_limit_requests_per_minute"),
            ("LOG_LEVEL", "logging.level"),
            ("LOG_FORMAT", "logging.format"),
            ("OTEL_ENABLED", "logging.opentelemetry_enabled"),
            ("OTLP_ENDPOINT", "logging.otlp_endpoint"),
            ("ENABLE_METRICS", "monitoring.enable_metrics"),
            ("ENABLE_HEALTH_CHECK", "monitoring.enable_health_check"),
            ("METRICS_PORT", "monitoring.metrics_port"),
            ("HAPI_FHIR_URL", "fhir.hapi_fhir_url"),
            ("HAPI_FHIR_BACKUP_URL", "fhir.hapi_fhir_backup_url"),
            ("HAPI_FHIR_TIMEOUT_SECONDS", "fhir.hapi_fhir_timeout_seconds"),
            ("FHIR_VALIDATION_ENABLED", "fhir.fhir_validation_enabled"),
            ("FHIR_VERSION", "fhir.fhir_version"),
            ("PIPELINE_MAX_RETRIES", "pipeline.max_retries"),
            ("PIPELINE_MAX_CONCURRENT_REQUESTS", "pipeline.max_concurrent_requests"),
            ("PIPELINE_SLA_SECONDS", "pipeline.sla_seconds"),
            ("PIPELINE_CACHE_CAPACITY", "pipeline.cache_capacity"),
            ("PIPELINE_CACHE_TTL_SECONDS", "pipeline.cache_ttl_seconds"),
            ("IMAGING_REJECT_SYNTHESIZED_SERIES_UID", "pipeline.imaging_reject_synthesized_series_uid"),
            ("SAFETY_VALIDATION_ENABLED", "pipeline.safety_validation_enabled"),
            ("SUMMARIZATION_ENABLED", "pipeline.summarization_enabled"),
        ];

        mappings
            .iter()
            .filter_map(|(env_name, key)| std::env::var(env_name).ok().map(|v| (key.to_string(), v)))
            .collect()
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.server.host, self.server.port).parse()?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fhir.hapi_fhir_url.is_empty() {
            anyhow::bail!("HAPI_FHIR_URL must not be empty");
        }
        if self.performance.rate_limit_requests_per_minute == 0 {
            anyhow::bail!("RATE_LIMIT_REQUESTS_PER_MINUTE must be greater than zero");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            performance: PerformanceConfig::default(),
            logging: LoggingConfig::default(),
            monitoring: MonitoringConfig::default(),
            fhir: FhirConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}
