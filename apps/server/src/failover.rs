//! Failover Manager (C10): an ordered list of external FHIR server
//! endpoints, lazy health probing, and failover-event bookkeeping.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use fhir_pipeline_models::{EndpointDescriptor, EndpointHealth, EndpointRole};

use crate::config::FhirConfig;

/// After this many consecutive failures a descriptor is marked `Down`.
/// Fewer than that, but at least one, and it is `Degraded`.
const DOWN_THRESHOLD: u32 = 3;

/// How long a `Down` descriptor is left alone before the next call is
/// allowed to probe it again (the "lazy, on-use" probe of §4.10 — there is
/// no background task, just a clock checked at selection time).
const PROBE_BACKOFF: Duration = Duration::from_secs(30);

struct Descriptor {
    endpoint: EndpointDescriptor,
    last_error_at: Option<Instant>,
}

/// One mutex per descriptor, per the shared-resource policy — a probe or a
/// call outcome on one endpoint never blocks readers of another.
pub struct FailoverManager {
    endpoints: Vec<Mutex<Descriptor>>,
    failover_events: Mutex<u64>,
}

impl FailoverManager {
    pub fn from_config(config: &FhirConfig) -> Self {
        let mut endpoints = vec![Mutex::new(Descriptor {
            endpoint: EndpointDescriptor::new("primary", config.hapi_fhir_url.clone(), EndpointRole::Primary),
            last_error_at: None,
        })];
        if let Some(backup_url) = &config.hapi_fhir_backup_url {
            endpoints.push(Mutex::new(Descriptor {
                endpoint: EndpointDescriptor::new("backup", backup_url.clone(), EndpointRole::Backup),
                last_error_at: None,
            }));
        }
        Self { endpoints, failover_events: Mutex::new(0) }
    }

    /// Returns the first healthy endpoint's descriptor (probing any `Down`
    /// descriptor whose backoff has elapsed along the way). If none are
    /// healthy, falls back to the primary and records a failover event.
    pub fn get_active_endpoint(&self) -> EndpointDescriptor {
        for slot in &self.endpoints {
            let mut descriptor = slot.lock().unwrap();
            self.maybe_probe(&mut descriptor);
            if !matches!(descriptor.endpoint.health, EndpointHealth::Down) {
                return descriptor.endpoint.clone();
            }
        }

        *self.failover_events.lock().unwrap() += 1;
        let primary = self.endpoints[0].lock().unwrap();
        primary.endpoint.clone()
    }

    /// A `Down` descriptor is eligible for re-probing once its backoff has
    /// elapsed; re-probing here means giving the next call a chance to
    /// prove it healthy again rather than running an out-of-band check.
    fn maybe_probe(&self, descriptor: &mut Descriptor) {
        if !matches!(descriptor.endpoint.health, EndpointHealth::Down) {
            return;
        }
        if descriptor.last_error_at.map(|t| t.elapsed() >= PROBE_BACKOFF).unwrap_or(true) {
            descriptor.endpoint.health = EndpointHealth::Degraded;
        }
    }

    pub fn record_success(&self, name: &str) {
        if let Some(slot) = self.find(name) {
            let mut descriptor = slot.lock().unwrap();
            descriptor.endpoint.consecutive_failures = 0;
            descriptor.endpoint.health = EndpointHealth::Healthy;
            descriptor.last_error_at = None;
        }
    }

    pub fn record_failure(&self, name: &str) {
        if let Some(slot) = self.find(name) {
            let mut descriptor = slot.lock().unwrap();
            descriptor.endpoint.consecutive_failures += 1;
            descriptor.last_error_at = Some(Instant::now());
            descriptor.endpoint.health = if descriptor.endpoint.consecutive_failures >= DOWN_THRESHOLD {
                EndpointHealth::Down
            } else {
                EndpointHealth::Degraded
            };
        }
    }

    fn find(&self, name: &str) -> Option<&Mutex<Descriptor>> {
        self.endpoints.iter().find(|slot| slot.lock().unwrap().endpoint.name == name)
    }

    pub fn meets_availability_target(&self) -> bool {
        let healthy = self
            .endpoints
            .iter()
            .filter(|slot| !matches!(slot.lock().unwrap().endpoint.health, EndpointHealth::Down))
            .count();
        healthy >= 1 && self.endpoints.len() >= 2
    }

    pub fn endpoint_health(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.iter().map(|slot| slot.lock().unwrap().endpoint.clone()).collect()
    }

    pub fn failover_event_count(&self) -> u64 {
        *self.failover_events.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backup: Option<&str>) -> FhirConfig {
        FhirConfig {
            hapi_fhir_url: "http://primary.example/fhir".to_string(),
            hapi_fhir_backup_url: backup.map(str::to_string),
            hapi_fhir_timeout_seconds: 10,
            fhir_validation_enabled: true,
            fhir_version: "R4".to_string(),
        }
    }

    #[test]
    fn single_endpoint_pool_never_meets_availability_target() {
        let manager = FailoverManager::from_config(&config(None));
        assert!(!manager.meets_availability_target());
    }

    #[test]
    fn two_healthy_endpoints_meet_availability_target() {
        let manager = FailoverManager::from_config(&config(Some("http://backup.example/fhir")));
        assert!(manager.meets_availability_target());
    }

    #[test]
    fn primary_is_selected_while_healthy() {
        let manager = FailoverManager::from_config(&config(Some("http://backup.example/fhir")));
        assert_eq!(manager.get_active_endpoint().name, "primary");
    }

    #[test]
    fn repeated_failures_mark_primary_down_and_select_backup() {
        let manager = FailoverManager::from_config(&config(Some("http://backup.example/fhir")));
        for _ in 0..DOWN_THRESHOLD {
            manager.record_failure("primary");
        }
        assert_eq!(manager.get_active_endpoint().name, "backup");
    }

    #[test]
    fn falls_back_to_primary_and_records_failover_event_when_all_down() {
        let manager = FailoverManager::from_config(&config(Some("http://backup.example/fhir")));
        for _ in 0..DOWN_THRESHOLD {
            manager.record_failure("primary");
            manager.record_failure("backup");
        }
        let active = manager.get_active_endpoint();
        assert_eq!(active.name, "primary");
        assert_eq!(manager.failover_event_count(), 1);
    }

    #[test]
    fn success_resets_failure_count() {
        let manager = FailoverManager::from_config(&config(None));
        manager.record_failure("primary");
        manager.record_failure("primary");
        manager.record_success("primary");
        let health = manager.endpoint_health();
        assert_eq!(health[0].consecutive_failures, 0);
        assert!(matches!(health[0].health, EndpointHealth::Healthy));
    }
}
