//! Distributed Instance Registry (C11). Heartbeats this process into a
//! shared registry, computes a per-instance load score, aggregates cluster
//! health, evicts stale instances, and scores cluster load balance.

use crate::config::CoreConfig;
use crate::event::{InstanceRecord, InstanceStatus, LoadMetrics};
use crate::sla::SlaMonitor;
use crate::store::StoreAdapter;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INSTANCES_HASH_KEY: &str = "signal_service:instances";
const CLUSTER_HEALTH_KEY: &str = "signal_service:cluster_health";

fn health_key(instance_id: &str) -> String {
    format!("signal_service:health:{instance_id}")
}

/// Deterministic, bounded [0, 100] load score.
pub fn load_score(metrics: &LoadMetrics) -> f64 {
    let mut score = 100.0;
    score -= if metrics.cpu_pct > 80.0 {
        30.0
    } else if metrics.cpu_pct > 60.0 {
        15.0
    } else if metrics.cpu_pct > 40.0 {
        5.0
    } else {
        0.0
    };
    score -= if metrics.rss_mb > 1024.0 {
        20.0
    } else if metrics.rss_mb > 512.0 {
        10.0
    } else {
        0.0
    };
    score -= if metrics.requests_per_minute > 200.0 {
        15.0
    } else if metrics.requests_per_minute > 100.0 {
        5.0
    } else {
        0.0
    };
    score.clamp(0.0, 100.0)
}

/// This instance's standing relative to *cluster* health, distinct from its
/// own `load_score`: penalized when the last-observed `cluster_status` is
/// degraded or unhealthy, untouched when the cluster is healthy or unknown.
pub fn coordination_score(load_score: f64, cluster_status: Option<ClusterStatus>) -> f64 {
    let penalty = match cluster_status {
        Some(ClusterStatus::Degraded) => 20.0,
        Some(ClusterStatus::Unhealthy) => 40.0,
        Some(ClusterStatus::Healthy) | None => 0.0,
    };
    (load_score - penalty).clamp(0.0, 100.0)
}

fn status_for_score(score: f64) -> InstanceStatus {
    if score >= 80.0 {
        InstanceStatus::Healthy
    } else if score >= 60.0 {
        InstanceStatus::Degraded
    } else {
        InstanceStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct ClusterHealth {
    pub status: ClusterStatus,
    pub instance_count: usize,
    pub healthy_fraction: f64,
    pub load_balance_score: Option<f64>,
}

/// Coefficient-of-variation based load-balance score; `None` means a
/// computation error occurred (surfaced as an SLA observation by the
/// caller), not a flat fallback value. A cluster with fewer than two
/// instances trivially scores 100.
pub fn load_balance_score(requests_per_minute: &[f64]) -> Option<f64> {
    if requests_per_minute.len() < 2 {
        return Some(100.0);
    }
    let n = requests_per_minute.len() as f64;
    let mean = requests_per_minute.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return Some(100.0);
    }
    let variance = requests_per_minute.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    let cv = stddev / mean;
    Some((100.0 - cv * 100.0).max(0.0))
}

pub struct InstanceRegistry {
    store: Arc<dyn StoreAdapter>,
    sla: Arc<SlaMonitor>,
    config: Arc<CoreConfig>,
    instance_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    request_counter: AtomicU64,
    last_cluster_status: Mutex<Option<ClusterStatus>>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn StoreAdapter>, sla: Arc<SlaMonitor>, config: Arc<CoreConfig>) -> Self {
        Self {
            store,
            sla,
            config,
            instance_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            request_counter: AtomicU64::new(0),
            last_cluster_status: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn note_request(&self) {
        self.request_counter.fetch_add(1, Ordering::Relaxed);
    }

    fn collect_load_metrics(&self) -> LoadMetrics {
        let mut system = System::new();
        system.refresh_all();
        let pid = Pid::from_u32(std::process::id());
        let (cpu_pct, rss_mb) = system
            .process(pid)
            .map(|p| (p.cpu_usage() as f64, p.memory() as f64 / (1024.0 * 1024.0)))
            .unwrap_or((0.0, 0.0));

        LoadMetrics {
            cpu_pct,
            rss_mb,
            connections: 0,
            threads: system.processes().len() as u64,
            requests_per_minute: self.request_counter.swap(0, Ordering::Relaxed) as f64,
            queue_depth: 0,
            processing_rate: 0.0,
        }
    }

    async fn heartbeat_once(&self) {
        let metrics = self.collect_load_metrics();
        let score = load_score(&metrics);
        let coord_score = coordination_score(score, *self.last_cluster_status.lock());
        let record = InstanceRecord {
            instance_id: self.instance_id.clone(),
            started_at: self.started_at,
            pid: std::process::id(),
            host: hostname(),
            status: status_for_score(score),
            last_seen_at: Utc::now(),
            load_metrics: metrics,
            load_score: score,
            coordination_score: coord_score,
            assigned_entities: Vec::new(),
        };

        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(err) = self.store.hash_set(INSTANCES_HASH_KEY, &self.instance_id, &json).await {
                    warn!(error = %err, "failed to write instance record to registry hash");
                }
                if let Err(err) = self
                    .store
                    .set_with_ttl(&health_key(&self.instance_id), json.as_bytes(), self.config.instance_health_ttl)
                    .await
                {
                    warn!(error = %err, "failed to write per-instance health key");
                }
                metrics::gauge!("instance_load_score", "instance_id" => self.instance_id.clone()).set(score);
                metrics::gauge!("instance_coordination_score", "instance_id" => self.instance_id.clone()).set(coord_score);
            }
            Err(err) => warn!(error = %err, "failed to serialize instance record"),
        }
    }

    pub async fn run_heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat_once().await;
                    debug!(instance_id = %self.instance_id, "heartbeat recorded");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(instance_id = %self.instance_id, "deregistering instance on shutdown");
                        let _ = self.store.hash_delete(INSTANCES_HASH_KEY, &[self.instance_id.clone()]).await;
                        break;
                    }
                }
            }
        }
    }

    async fn aggregate_once(&self) -> anyhow::Result<ClusterHealth> {
        let all = self.store.hash_get_all(INSTANCES_HASH_KEY).await?;
        let now = Utc::now();
        let mut live = Vec::new();
        let mut stale_ids = Vec::new();

        for (id, json) in all {
            match serde_json::from_str::<InstanceRecord>(&json) {
                Ok(record) => {
                    if (now - record.last_seen_at).num_seconds() as u64 > self.config.instance_stale_after.as_secs() {
                        stale_ids.push(id);
                    } else {
                        live.push(record);
                    }
                }
                Err(err) => {
                    warn!(instance_id = id, error = %err, "failed to deserialize instance record, treating as stale");
                    stale_ids.push(id);
                }
            }
        }

        if !stale_ids.is_empty() {
            info!(count = stale_ids.len(), "evicting stale instances");
            if let Err(err) = self.store.hash_delete(INSTANCES_HASH_KEY, &stale_ids).await {
                warn!(error = %err, "failed to evict stale instances");
            }
        }

        let total = live.len();
        let healthy = live.iter().filter(|r| r.status == InstanceStatus::Healthy).count();
        let healthy_fraction = if total == 0 { 1.0 } else { healthy as f64 / total as f64 };

        let status = if healthy_fraction >= 0.8 {
            ClusterStatus::Healthy
        } else if healthy_fraction >= 0.5 {
            ClusterStatus::Degraded
        } else {
            ClusterStatus::Unhealthy
        };

        let rpms: Vec<f64> = live.iter().map(|r| r.load_metrics.requests_per_minute).collect();
        let balance = load_balance_score(&rpms);
        if balance.is_none() {
            self.sla.record_stale_recovery("registry_aggregate_health", f64::MAX).await;
        }

        *self.last_cluster_status.lock() = Some(status);

        let health = ClusterHealth {
            status,
            instance_count: total,
            healthy_fraction,
            load_balance_score: balance,
        };

        let payload = serde_json::json!({
            "status": format!("{:?}", health.status),
            "instance_count": health.instance_count,
            "healthy_fraction": health.healthy_fraction,
            "load_balance_score": health.load_balance_score,
            "computed_at": now.to_rfc3339(),
        });
        self.store
            .set_with_ttl(CLUSTER_HEALTH_KEY, payload.to_string().as_bytes(), self.config.instance_health_ttl)
            .await?;

        Ok(health)
    }

    pub async fn run_aggregate_health_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.aggregate_health_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.aggregate_once().await {
                        Ok(health) => debug!(status = ?health.status, instances = health.instance_count, "aggregate health computed"),
                        Err(err) => warn!(error = %err, "aggregate health pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_score_full_health() {
        let metrics = LoadMetrics {
            cpu_pct: 10.0,
            rss_mb: 100.0,
            requests_per_minute: 10.0,
            ..Default::default()
        };
        assert_eq!(load_score(&metrics), 100.0);
    }

    #[test]
    fn load_score_monotonic_in_cpu() {
        let low = load_score(&LoadMetrics { cpu_pct: 50.0, ..Default::default() });
        let high = load_score(&LoadMetrics { cpu_pct: 90.0, ..Default::default() });
        assert!(high <= low);
    }

    #[test]
    fn load_score_monotonic_in_rss() {
        let low = load_score(&LoadMetrics { rss_mb: 200.0, ..Default::default() });
        let high = load_score(&LoadMetrics { rss_mb: 2000.0, ..Default::default() });
        assert!(high <= low);
    }

    #[test]
    fn load_score_clamped_at_zero() {
        let metrics = LoadMetrics {
            cpu_pct: 95.0,
            rss_mb: 2000.0,
            requests_per_minute: 500.0,
            ..Default::default()
        };
        assert!(load_score(&metrics) >= 0.0);
    }

    #[test]
    fn single_instance_cluster_is_trivially_balanced() {
        assert_eq!(load_balance_score(&[42.0]), Some(100.0));
        assert_eq!(load_balance_score(&[]), Some(100.0));
    }

    #[test]
    fn uneven_load_lowers_balance_score() {
        let even = load_balance_score(&[100.0, 100.0, 100.0]).unwrap();
        let uneven = load_balance_score(&[10.0, 100.0, 300.0]).unwrap();
        assert!(uneven < even);
    }

    #[test]
    fn coordination_score_untouched_when_cluster_healthy() {
        assert_eq!(coordination_score(90.0, Some(ClusterStatus::Healthy)), 90.0);
        assert_eq!(coordination_score(90.0, None), 90.0);
    }

    #[test]
    fn coordination_score_penalized_by_cluster_status() {
        let healthy = coordination_score(90.0, Some(ClusterStatus::Healthy));
        let degraded = coordination_score(90.0, Some(ClusterStatus::Degraded));
        let unhealthy = coordination_score(90.0, Some(ClusterStatus::Unhealthy));
        assert!(degraded < healthy);
        assert!(unhealthy < degraded);
    }

    #[test]
    fn coordination_score_clamped_at_zero() {
        assert_eq!(coordination_score(10.0, Some(ClusterStatus::Unhealthy)), 0.0);
    }
}
