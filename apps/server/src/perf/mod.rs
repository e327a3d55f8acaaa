//! Performance Manager (C9): validation/resource/bundle LRU caches with TTL,
//! a bounded metrics ring buffer, and an auto-tuning pass.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fhir_pipeline_models::PerformanceMetricRecord;
use lru::LruCache;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const METRICS_CAP: usize = 10_000;
const RECENT_WINDOW: usize = 100;

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
}

struct Caches {
    validation: LruCache<String, CacheEntry>,
    resource: LruCache<String, CacheEntry>,
    bundle: LruCache<String, CacheEntry>,
}

struct OperationStart {
    operation: String,
    resource_count: usize,
    started_at: Instant,
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct Tunables {
    capacity: usize,
    ttl: Duration,
    request_timeout: Duration,
    max_concurrent_requests: u32,
}

/// Process-wide singleton holding the three caches and the metrics ring
/// buffer. Each cache and the metrics deque have their own mutex per the
/// shared-resource discipline: short critical sections, no global lock.
pub struct PerformanceManager {
    caches: Mutex<Caches>,
    stats: CacheStats,
    metrics: Mutex<VecDeque<(Instant, PerformanceMetricRecord)>>,
    operations: Mutex<HashMap<String, OperationStart>>,
    tunables: Mutex<Tunables>,
    tracking_seq: AtomicU64,
}

impl PerformanceManager {
    pub fn new(cache_capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            caches: Mutex::new(Caches {
                validation: LruCache::new(cap),
                resource: LruCache::new(cap),
                bundle: LruCache::new(cap),
            }),
            stats: CacheStats::default(),
            metrics: Mutex::new(VecDeque::new()),
            operations: Mutex::new(HashMap::new()),
            tunables: Mutex::new(Tunables {
                capacity: cache_capacity.max(1),
                ttl,
                request_timeout: Duration::from_secs(10),
                max_concurrent_requests: 10,
            }),
            tracking_seq: AtomicU64::new(0),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.tunables.lock().unwrap().request_timeout
    }

    pub fn max_concurrent_requests(&self) -> u32 {
        self.tunables.lock().unwrap().max_concurrent_requests
    }

    /// PHI-safe structural fingerprint: resource types, entry count,
    /// presence of identifiers/references — never field values.
    pub fn generate_bundle_hash(&self, bundle: &Value) -> String {
        let mut safe = serde_json::Map::new();
        safe.insert("resourceType".to_string(), bundle.get("resourceType").cloned().unwrap_or(Value::Null));
        safe.insert("type".to_string(), bundle.get("type").cloned().unwrap_or(Value::Null));
        let entries = bundle.get("entry").and_then(Value::as_array).cloned().unwrap_or_default();
        safe.insert("entry_count".to_string(), json!(entries.len()));

        let mut resource_types = Vec::new();
        for entry in &entries {
            if let Some(resource) = entry.get("resource") {
                let field_count = resource.as_object().map(|m| m.len()).unwrap_or(0);
                resource_types.push(json!({
                    "resourceType": resource.get("resourceType").cloned().unwrap_or(Value::Null),
                    "field_count": field_count,
                    "has_identifier": resource.get("identifier").is_some(),
                    "has_reference": has_any_reference(resource),
                }));
            }
        }
        safe.insert("resource_types".to_string(), Value::Array(resource_types));

        let canonical = serde_json::to_string(&Value::Object(safe)).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    pub fn get_cached_validation(&self, key: &str) -> Option<Value> {
        self.get_from(key, |c| &mut c.validation)
    }

    pub fn cache_validation(&self, key: String, value: Value) {
        self.put_into(key, value, |c| &mut c.validation);
    }

    pub fn get_cached_resource(&self, key: &str) -> Option<Value> {
        self.get_from(key, |c| &mut c.resource)
    }

    pub fn cache_resource(&self, key: String, value: Value) {
        self.put_into(key, value, |c| &mut c.resource);
    }

    pub fn get_cached_bundle(&self, key: &str) -> Option<Value> {
        self.get_from(key, |c| &mut c.bundle)
    }

    pub fn cache_bundle(&self, key: String, value: Value) {
        self.put_into(key, value, |c| &mut c.bundle);
    }

    fn get_from(&self, key: &str, select: impl Fn(&mut Caches) -> &mut LruCache<String, CacheEntry>) -> Option<Value> {
        let ttl = self.tunables.lock().unwrap().ttl;
        let mut caches = self.caches.lock().unwrap();
        let cache = select(&mut caches);
        if let Some(entry) = cache.get(key) {
            if entry.inserted_at.elapsed() > ttl {
                cache.pop(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn put_into(&self, key: String, value: Value, select: impl Fn(&mut Caches) -> &mut LruCache<String, CacheEntry>) {
        let mut caches = self.caches.lock().unwrap();
        let cache = select(&mut caches);
        if cache.len() >= cache.cap().get() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        cache.put(key, CacheEntry { value, inserted_at: Instant::now() });
    }

    /// Returns an opaque tracking id; pair with [`Self::end_performance_tracking`].
    pub fn start_performance_tracking(&self, operation_type: &str, resource_count: usize) -> String {
        let seq = self.tracking_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{operation_type}-{seq}");
        self.operations.lock().unwrap().insert(
            id.clone(),
            OperationStart { operation: operation_type.to_string(), resource_count, started_at: Instant::now() },
        );
        id
    }

    pub fn end_performance_tracking(&self, tracking_id: &str, success: bool, cache_hit: bool) -> Option<PerformanceMetricRecord> {
        let start = self.operations.lock().unwrap().remove(tracking_id)?;
        let duration = start.started_at.elapsed();
        let record = PerformanceMetricRecord {
            operation: start.operation,
            duration,
            cache_hit,
            success,
        };

        if duration.as_secs_f64() > 2.0 {
            tracing::warn!(operation = %record.operation, duration_ms = duration.as_millis(), "performance target exceeded");
        }

        let _ = start.resource_count;
        let mut metrics = self.metrics.lock().unwrap();
        metrics.push_back((Instant::now(), record.clone()));
        if metrics.len() > METRICS_CAP {
            metrics.pop_front();
        }
        Some(record)
    }

    pub fn clear_caches(&self) -> Value {
        let mut caches = self.caches.lock().unwrap();
        let validation_cleared = caches.validation.len();
        let resource_cleared = caches.resource.len();
        let bundle_cleared = caches.bundle.len();
        caches.validation.clear();
        caches.resource.clear();
        caches.bundle.clear();
        drop(caches);

        self.stats.hits.store(0, Ordering::Relaxed);
        self.stats.misses.store(0, Ordering::Relaxed);
        self.stats.evictions.store(0, Ordering::Relaxed);

        json!({
            "validation_entries_cleared": validation_cleared,
            "resource_entries_cleared": resource_cleared,
            "bundle_entries_cleared": bundle_cleared,
        })
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn get_performance_summary(&self) -> Value {
        let metrics = self.metrics.lock().unwrap();
        if metrics.is_empty() {
            return json!({ "message": "No performance data available" });
        }

        let total = metrics.len();
        let successful = metrics.iter().filter(|(_, m)| m.success).count();
        let success_rate = successful as f64 / total as f64;

        let mut by_op: HashMap<String, Vec<f64>> = HashMap::new();
        for (_, m) in metrics.iter() {
            by_op.entry(m.operation.clone()).or_default().push(m.duration.as_secs_f64() * 1000.0);
        }
        let operation_breakdown: HashMap<String, Value> = by_op
            .into_iter()
            .map(|(op, durations)| {
                let avg = durations.iter().sum::<f64>() / durations.len() as f64;
                let min = durations.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = durations.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                (op, json!({ "average_ms": avg, "min_ms": min, "max_ms": max, "count": durations.len() }))
            })
            .collect();

        let all_durations: Vec<f64> = metrics.iter().map(|(_, m)| m.duration.as_secs_f64() * 1000.0).collect();
        let avg_duration = all_durations.iter().sum::<f64>() / all_durations.len() as f64;
        let recent: Vec<f64> = all_durations[all_durations.len().saturating_sub(RECENT_WINDOW)..].to_vec();
        let recent_avg = recent.iter().sum::<f64>() / recent.len() as f64;

        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let evictions = self.stats.evictions.load(Ordering::Relaxed);
        let hit_rate = self.hit_rate();

        json!({
            "overall_statistics": {
                "total_operations": total,
                "success_rate": success_rate,
                "success_target_met": success_rate >= 0.95,
                "average_duration_ms": avg_duration,
                "recent_average_ms": recent_avg,
                "performance_target_met": recent_avg < 2000.0,
            },
            "operation_breakdown": operation_breakdown,
            "cache_performance": {
                "hit_rate": hit_rate,
                "hits": hits,
                "misses": misses,
                "evictions": evictions,
                "target_met": hit_rate >= 0.8,
            },
        })
    }

    pub fn get_real_time_metrics(&self) -> Value {
        let metrics = self.metrics.lock().unwrap();
        let cutoff = Instant::now() - Duration::from_secs(300);
        let recent: Vec<&PerformanceMetricRecord> =
            metrics.iter().filter(|(ts, _)| *ts >= cutoff).map(|(_, m)| m).collect();

        if recent.is_empty() {
            return json!({ "message": "No recent metrics available" });
        }

        let total = recent.len();
        let successful = recent.iter().filter(|m| m.success).count();
        let avg_duration = recent.iter().map(|m| m.duration.as_secs_f64() * 1000.0).sum::<f64>() / total as f64;

        json!({
            "time_window": "5 minutes",
            "total_operations": total,
            "success_rate": successful as f64 / total as f64,
            "average_duration_ms": avg_duration,
            "performance_target_met": avg_duration < 2000.0,
            "cache_hit_rate_recent": self.hit_rate(),
        })
    }

    /// Auto-tunes cache TTL/capacity and request timeout/concurrency from
    /// observed hit rate and recent average duration (§4.9).
    pub fn optimize_performance_settings(&self) -> Value {
        let mut recommendations = Vec::new();
        let hit_rate = self.hit_rate();
        let evictions = self.stats.evictions.load(Ordering::Relaxed);

        let mut tunables = self.tunables.lock().unwrap();

        if hit_rate < 0.5 && (self.stats.hits.load(Ordering::Relaxed) + self.stats.misses.load(Ordering::Relaxed)) > 0 {
            let old_ttl = tunables.ttl;
            let new_secs = (old_ttl.as_secs_f64() * 1.5).min(7200.0);
            tunables.ttl = Duration::from_secs_f64(new_secs);
            recommendations.push(format!("Increased cache TTL from {}s to {}s", old_ttl.as_secs(), tunables.ttl.as_secs()));
        }

        if hit_rate > 0.9 && evictions > 100 {
            let old_cap = tunables.capacity;
            let new_cap = ((old_cap as f64 * 1.2) as usize).min(5000);
            tunables.capacity = new_cap;
            let mut caches = self.caches.lock().unwrap();
            if let Some(cap) = NonZeroUsize::new(new_cap) {
                caches.validation.resize(cap);
                caches.resource.resize(cap);
                caches.bundle.resize(cap);
            }
            recommendations.push(format!("Increased cache size from {old_cap} to {new_cap}"));
        }

        let metrics = self.metrics.lock().unwrap();
        if metrics.len() > 50 {
            let recent: Vec<f64> =
                metrics.iter().rev().take(50).map(|(_, m)| m.duration.as_secs_f64() * 1000.0).collect();
            let avg = recent.iter().sum::<f64>() / recent.len() as f64;
            if avg > 2000.0 {
                let old_timeout = tunables.request_timeout;
                let new_timeout = Duration::from_secs_f64((old_timeout.as_secs_f64() * 0.8).max(10.0));
                tunables.request_timeout = new_timeout;
                recommendations.push(format!(
                    "Reduced request timeout from {}s to {}s",
                    old_timeout.as_secs(),
                    new_timeout.as_secs()
                ));

                let old_concurrent = tunables.max_concurrent_requests;
                tunables.max_concurrent_requests = (old_concurrent + 2).min(20);
                recommendations.push(format!(
                    "Increased max concurrent requests from {old_concurrent} to {}",
                    tunables.max_concurrent_requests
                ));
            }
        }

        if recommendations.is_empty() {
            recommendations.push("Performance is within targets - no immediate optimizations needed".to_string());
        }

        json!({
            "optimizations_applied": recommendations.len(),
            "recommendations": recommendations,
            "current_settings": {
                "cache_ttl_seconds": tunables.ttl.as_secs(),
                "cache_capacity": tunables.capacity,
                "request_timeout_seconds": tunables.request_timeout.as_secs(),
                "max_concurrent_requests": tunables.max_concurrent_requests,
            },
        })
    }
}

fn has_any_reference(resource: &Value) -> bool {
    fn walk(value: &Value) -> bool {
        match value {
            Value::Object(map) => map.contains_key("reference") || map.values().any(walk),
            Value::Array(items) => items.iter().any(walk),
            _ => false,
        }
    }
    walk(resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trip_hits() {
        let manager = PerformanceManager::new(10, Duration::from_secs(3600));
        manager.cache_validation("k1".to_string(), json!({"valid": true}));
        assert_eq!(manager.get_cached_validation("k1"), Some(json!({"valid": true})));
        assert_eq!(manager.get_cached_validation("missing"), None);
    }

    #[test]
    fn ttl_expiry_evicts_entry() {
        let manager = PerformanceManager::new(10, Duration::from_millis(1));
        manager.cache_validation("k1".to_string(), json!({"valid": true}));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.get_cached_validation("k1"), None);
    }

    #[test]
    fn bundle_hash_is_stable_and_phi_safe() {
        let manager = PerformanceManager::new(10, Duration::from_secs(3600));
        let bundle = json!({
            "resourceType": "Bundle", "type": "transaction",
            "entry": [{ "resource": { "resourceType": "Patient", "id": "p1", "name": [{"family": "Smith"}] } }]
        });
        let hash1 = manager.generate_bundle_hash(&bundle);
        let hash2 = manager.generate_bundle_hash(&bundle);
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 16);
        assert!(!hash1.contains("Smith"));
    }

    #[test]
    fn tracking_round_trip_records_metric() {
        let manager = PerformanceManager::new(10, Duration::from_secs(3600));
        let id = manager.start_performance_tracking("validation", 3);
        let record = manager.end_performance_tracking(&id, true, false).unwrap();
        assert_eq!(record.operation, "validation");
        assert!(record.success);
    }

    #[test]
    fn low_hit_rate_increases_ttl() {
        let manager = PerformanceManager::new(10, Duration::from_secs(100));
        for i in 0..5 {
            manager.get_cached_validation(&format!("miss-{i}"));
        }
        let result = manager.optimize_performance_settings();
        assert!(result["recommendations"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r.as_str().unwrap().contains("Increased cache TTL")));
    }
}
