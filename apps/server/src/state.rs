//! Process-wide shared state, threaded through axum handlers via `State<AppState>`.

use std::sync::Arc;

use fhir_pipeline_coding::CodingRegistry;
use fhir_pipeline_validator::ValidatorRegistry;

use crate::api::middleware::rate_limit::RateLimiter;
use crate::api::middleware::timing::PerformanceTracker;
use crate::bundle::optimizer::QualityOptimizer;
use crate::failover::FailoverManager;
use crate::fhir_client::FhirClient;
use crate::orchestrator::Orchestrator;
use crate::perf::PerformanceManager;
use crate::registry::{FactoryRegistry, FeatureFlags};
use crate::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub coding_registry: Arc<CodingRegistry>,
    pub validator_registry: Arc<ValidatorRegistry>,
    pub factory_registry: Arc<FactoryRegistry>,
    pub quality_optimizer: Arc<QualityOptimizer>,
    pub performance_manager: Arc<PerformanceManager>,
    pub failover_manager: Arc<FailoverManager>,
    pub fhir_client: Arc<FhirClient>,
    pub orchestrator: Arc<Orchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub performance_tracker: Arc<PerformanceTracker>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let coding_registry = Arc::new(CodingRegistry::new());
        let validator_registry = Arc::new(ValidatorRegistry::new());
        let factory_registry = Arc::new(FactoryRegistry::with_flags(
            coding_registry.clone(),
            FeatureFlags::default(),
            config.pipeline.imaging_reject_synthesized_series_uid,
            config.pipeline.safety_validation_enabled,
        ));
        let quality_optimizer = Arc::new(QualityOptimizer::new(validator_registry.clone()));
        let performance_manager = Arc::new(PerformanceManager::new(
            config.pipeline.cache_capacity,
            std::time::Duration::from_secs(config.pipeline.cache_ttl_seconds),
        ));
        let failover_manager = Arc::new(FailoverManager::from_config(&config.fhir));
        let fhir_client = Arc::new(FhirClient::new(&config)?);
        let orchestrator = Arc::new(Orchestrator::new(
            factory_registry.clone(),
            validator_registry.clone(),
            quality_optimizer.clone(),
            performance_manager.clone(),
            failover_manager.clone(),
            fhir_client.clone(),
            config.clone(),
        ));
        let rate_limiter =
            Arc::new(RateLimiter::new(config.performance.rate_limit_requests_per_minute, 60));
        let performance_tracker = Arc::new(PerformanceTracker::new());

        Ok(Self {
            config,
            coding_registry,
            validator_registry,
            factory_registry,
            quality_optimizer,
            performance_manager,
            failover_manager,
            fhir_client,
            orchestrator,
            rate_limiter,
            performance_tracker,
        })
    }
}
