//! Shadow Comparator (C10). On a sampled fraction of lookup requests, runs
//! the registry path and the legacy path concurrently under a timeout,
//! compares results, and records a `ShadowObservation` into a bounded
//! ring. The legacy result is always what the caller receives.

use crate::config::CoreConfig;
use crate::event::{IntegrationMode, ShadowObservation};
use crate::mode::{IntegrationModeMachine, ModeTrigger};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

#[async_trait]
pub trait LookupBackend: Send + Sync {
    async fn lookup(&self, query: &str) -> anyhow::Result<serde_json::Value>;
}

/// Extracts the set of identifiers a result stands for, so the default
/// comparison predicate (set equality) can be evaluated without the
/// comparator knowing the result's concrete shape.
pub trait ResultExtractor: Send + Sync {
    fn extract_ids(&self, result: &serde_json::Value) -> HashSet<String>;
}

pub struct ShadowComparator {
    legacy: Arc<dyn LookupBackend>,
    registry: Arc<dyn LookupBackend>,
    extractor: Arc<dyn ResultExtractor>,
    mode: Arc<IntegrationModeMachine>,
    config: Arc<CoreConfig>,
    ring: Mutex<VecDeque<ShadowObservation>>,
    fallback_count: AtomicU32,
}

impl ShadowComparator {
    pub fn new(
        legacy: Arc<dyn LookupBackend>,
        registry: Arc<dyn LookupBackend>,
        extractor: Arc<dyn ResultExtractor>,
        mode: Arc<IntegrationModeMachine>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            legacy,
            registry,
            extractor,
            mode,
            config,
            ring: Mutex::new(VecDeque::new()),
            fallback_count: AtomicU32::new(0),
        }
    }

    pub async fn lookup(&self, query: &str) -> anyhow::Result<serde_json::Value> {
        match self.mode.current() {
            IntegrationMode::Disabled => self.legacy.lookup(query).await,
            IntegrationMode::Active => self.lookup_active(query).await,
            IntegrationMode::Shadow => self.lookup_shadow(query).await,
        }
    }

    async fn lookup_active(&self, query: &str) -> anyhow::Result<serde_json::Value> {
        match self.registry.lookup(query).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(query, error = %err, "registry lookup failed in active mode, falling back to legacy");
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                self.mode.consider_transition(ModeTrigger::RegistryFailures).await;
                self.legacy.lookup(query).await
            }
        }
    }

    async fn lookup_shadow(&self, query: &str) -> anyhow::Result<serde_json::Value> {
        let sampled: f64 = rand::thread_rng().gen();
        if sampled >= self.config.shadow_sample_rate {
            return self.legacy.lookup(query).await;
        }

        let timeout = self.config.shadow_path_timeout;
        let legacy_start = Instant::now();
        let legacy_fut = tokio::time::timeout(timeout, self.legacy.lookup(query));
        let registry_start = Instant::now();
        let registry_fut = tokio::time::timeout(timeout, self.registry.lookup(query));

        let (legacy_res, registry_res) = tokio::join!(legacy_fut, registry_fut);
        let legacy_latency_ms = legacy_start.elapsed().as_millis() as u64;
        let registry_latency_ms = registry_start.elapsed().as_millis() as u64;

        let legacy_value = match legacy_res {
            Ok(Ok(v)) => Some(v),
            Ok(Err(err)) => {
                warn!(query, error = %err, "legacy lookup failed during shadow comparison");
                None
            }
            Err(_) => {
                warn!(query, "legacy lookup timed out during shadow comparison");
                None
            }
        };
        let registry_value = match registry_res {
            Ok(Ok(v)) => Some(v),
            Ok(Err(err)) => {
                warn!(query, error = %err, "registry lookup failed during shadow comparison");
                None
            }
            Err(_) => {
                warn!(query, "registry lookup timed out during shadow comparison");
                None
            }
        };

        let results_match = match (&legacy_value, &registry_value) {
            (Some(l), Some(r)) => self.extractor.extract_ids(l) == self.extractor.extract_ids(r),
            _ => false,
        };

        self.record(ShadowObservation {
            query: query.to_string(),
            registry_result: registry_value.clone(),
            legacy_result: legacy_value.clone(),
            results_match,
            registry_latency_ms: registry_latency_ms.min(self.config.shadow_path_timeout.as_millis() as u64),
            legacy_latency_ms: legacy_latency_ms.min(self.config.shadow_path_timeout.as_millis() as u64),
            at: Utc::now(),
        });

        let match_rate = self.match_rate();
        let p95 = self.p95_registry_latency_ms();
        self.mode
            .consider_transition(ModeTrigger::ShadowModeSuccess { match_rate, p95_latency_ms: p95 })
            .await;

        legacy_value.ok_or_else(|| anyhow::anyhow!("legacy lookup unavailable for {query}"))
    }

    fn record(&self, obs: ShadowObservation) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.config.shadow_ring_capacity {
            ring.pop_front();
        }
        ring.push_back(obs);
    }

    pub fn match_rate(&self) -> f64 {
        let ring = self.ring.lock();
        if ring.is_empty() {
            return 1.0;
        }
        let matches = ring.iter().filter(|o| o.results_match).count();
        matches as f64 / ring.len() as f64
    }

    pub fn p95_registry_latency_ms(&self) -> f64 {
        let ring = self.ring.lock();
        if ring.is_empty() {
            return 0.0;
        }
        let mut latencies: Vec<u64> = ring.iter().map(|o| o.registry_latency_ms).collect();
        latencies.sort_unstable();
        let idx = ((latencies.len() as f64) * 0.95).ceil() as usize;
        let idx = idx.saturating_sub(1).min(latencies.len() - 1);
        latencies[idx] as f64
    }

    pub fn ring_len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn mode_machine(&self) -> &IntegrationModeMachine {
        &self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sla::SlaMonitor;

    struct FixedBackend(serde_json::Value);
    #[async_trait]
    impl LookupBackend for FixedBackend {
        async fn lookup(&self, _query: &str) -> anyhow::Result<serde_json::Value> {
            Ok(self.0.clone())
        }
    }

    struct IdExtractor;
    impl ResultExtractor for IdExtractor {
        fn extract_ids(&self, result: &serde_json::Value) -> HashSet<String> {
            result
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default()
        }
    }

    fn comparator(legacy: serde_json::Value, registry: serde_json::Value) -> ShadowComparator {
        let config = Arc::new(CoreConfig::default());
        let sla = Arc::new(SlaMonitor::new(config.clone()));
        let mode = Arc::new(IntegrationModeMachine::new(config.clone(), sla));
        ShadowComparator::new(
            Arc::new(FixedBackend(legacy)),
            Arc::new(FixedBackend(registry)),
            Arc::new(IdExtractor),
            mode,
            config,
        )
    }

    #[tokio::test]
    async fn disabled_mode_uses_legacy_only() {
        let c = comparator(serde_json::json!(["A", "B"]), serde_json::json!(["A", "C"]));
        c.mode_machine().consider_transition(ModeTrigger::Operator { to: IntegrationMode::Disabled, reason: "t".into() }).await;
        let result = c.lookup("q").await.unwrap();
        assert_eq!(result, serde_json::json!(["A", "B"]));
    }

    #[tokio::test]
    async fn shadow_mismatch_returns_legacy_and_records_observation() {
        let config = Arc::new(CoreConfig {
            shadow_sample_rate: 1.0,
            ..CoreConfig::default()
        });
        let sla = Arc::new(SlaMonitor::new(config.clone()));
        let mode = Arc::new(IntegrationModeMachine::new(config.clone(), sla));
        let c = ShadowComparator::new(
            Arc::new(FixedBackend(serde_json::json!(["A", "B"]))),
            Arc::new(FixedBackend(serde_json::json!(["A", "C"]))),
            Arc::new(IdExtractor),
            mode,
            config,
        );
        let result = c.lookup("q").await.unwrap();
        assert_eq!(result, serde_json::json!(["A", "B"]));
        assert_eq!(c.ring_len(), 1);
        assert!(c.match_rate() < 1.0);
    }
}
