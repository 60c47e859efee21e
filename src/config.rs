//! Runtime configuration. Loaded once at startup from `.env` plus the
//! process environment: search, then parse with a default, never panic on
//! an absent var.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Searches the current directory and the manifest directory for a `.env`
/// file and loads it if present. Silent no-op if neither exists, since this
/// is a convenience for local development, not a requirement.
pub fn load_env() {
    let candidates = [
        PathBuf::from(".env"),
        Path::new(env!("CARGO_MANIFEST_DIR")).join(".env"),
    ];
    for candidate in candidates {
        if candidate.exists() {
            let _ = dotenv::from_path(&candidate);
            break;
        }
    }
}

fn env_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Every cache-coordination tunable, collected into one struct constructed
/// once and shared by `Arc` with every component. Each field documents
/// which component reads it.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// C3: bound on in-flight family workers.
    pub max_concurrent_families: usize,
    /// C3: keys drained per `DeleteMany` batch.
    pub invalidation_batch_size: usize,
    /// C5: bound on in-flight indicator recompute tasks.
    pub max_concurrent_indicator_tasks: usize,

    /// C4: |Δspot|/spot threshold that triggers a Greeks recalc.
    pub greeks_spot_change_pct: f64,
    /// C4: |Δσ|/σ threshold that triggers a Greeks recalc.
    pub greeks_vol_change_pct: f64,
    /// C4: days-to-expiry threshold below which `expiry_approaching` fires.
    pub greeks_expiry_days: f64,
    /// C4: |Δdelta| threshold.
    pub greeks_delta_threshold: f64,
    /// C4: live TTL used to decide `cache_age_s > live_ttl` staleness.
    pub greeks_live_ttl: Duration,
    /// C4: instrument count above which a chain rebalance prefers bulk calc.
    pub greeks_bulk_threshold: usize,

    /// C5: price-change band boundaries (ascending), paired with the
    /// timeframe sets they add to the impacted set.
    pub indicator_price_band_pct: [f64; 4],
    /// C5: volume ratio threshold vs. previous volume.
    pub indicator_volume_spike_ratio: f64,
    /// C5: |Δimplied_vol|/σ threshold.
    pub indicator_vol_change_pct: f64,

    /// C6: below this |Δspot|/prev_spot, do nothing.
    pub moneyness_noop_pct: f64,
    /// C6: below this, selective refresh; above, full-chain refresh.
    pub moneyness_full_refresh_pct: f64,

    /// C9: match-rate threshold for shadow → active promotion.
    pub mode_match_rate_threshold: f64,
    /// C9: registry p95 latency threshold (ms) for shadow → active.
    pub mode_p95_latency_ms_threshold: u64,
    /// C9: error count within `mode_error_window` that demotes active → shadow.
    pub mode_error_count_threshold: u32,
    /// C9: rolling window over which `registry_error_count` is measured.
    /// Left unscoped by upstream requirements; fixed here as a configurable
    /// window.
    pub mode_error_window: Duration,

    /// C10: fraction of shadow-mode traffic that runs both paths.
    pub shadow_sample_rate: f64,
    /// C10: per-path timeout.
    pub shadow_path_timeout: Duration,
    /// C10: ring capacity.
    pub shadow_ring_capacity: usize,

    /// C11: heartbeat loop period.
    pub heartbeat_period: Duration,
    /// C11: aggregate-health loop period.
    pub aggregate_health_period: Duration,
    /// C11: staleness threshold for instance eviction.
    pub instance_stale_after: Duration,
    /// C11: TTL on the per-instance health key and the cluster-health key.
    pub instance_health_ttl: Duration,

    /// C12: ring capacity for SLA observations.
    pub sla_ring_capacity: usize,
    /// C12: invalidation_completion thresholds (minor, major) in seconds.
    pub sla_invalidation_completion_s: (f64, f64),
    /// C12: hit_rate thresholds (minor, major) as fractions.
    pub sla_hit_rate: (f64, f64),
    /// C12: coordination_latency p95 target (ms); >5x is an immediate violation.
    pub sla_coordination_latency_ms: f64,
    /// C12: stale_recovery thresholds (major, critical) in seconds.
    pub sla_stale_recovery_s: (f64, f64),
    /// C12: selective_efficiency minor threshold (fraction of keys saved).
    pub sla_selective_efficiency: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_families: env_var("CCC_MAX_CONCURRENT_FAMILIES", 5),
            invalidation_batch_size: env_var("CCC_INVALIDATION_BATCH_SIZE", 1000),
            max_concurrent_indicator_tasks: env_var("CCC_MAX_CONCURRENT_INDICATOR_TASKS", 3),

            greeks_spot_change_pct: env_var("CCC_GREEKS_SPOT_CHANGE_PCT", 0.5),
            greeks_vol_change_pct: env_var("CCC_GREEKS_VOL_CHANGE_PCT", 5.0),
            greeks_expiry_days: env_var("CCC_GREEKS_EXPIRY_DAYS", 7.0),
            greeks_delta_threshold: env_var("CCC_GREEKS_DELTA_THRESHOLD", 0.05),
            greeks_live_ttl: Duration::from_secs(env_var("CCC_GREEKS_LIVE_TTL_S", 60)),
            greeks_bulk_threshold: env_var("CCC_GREEKS_BULK_THRESHOLD", 5),

            indicator_price_band_pct: [0.5, 1.0, 2.0, 5.0],
            indicator_volume_spike_ratio: env_var("CCC_INDICATOR_VOLUME_SPIKE_RATIO", 2.0),
            indicator_vol_change_pct: env_var("CCC_INDICATOR_VOL_CHANGE_PCT", 10.0),

            moneyness_noop_pct: env_var("CCC_MONEYNESS_NOOP_PCT", 0.5),
            moneyness_full_refresh_pct: env_var("CCC_MONEYNESS_FULL_REFRESH_PCT", 2.0),

            mode_match_rate_threshold: env_var("CCC_MODE_MATCH_RATE_THRESHOLD", 0.95),
            mode_p95_latency_ms_threshold: env_var("CCC_MODE_P95_LATENCY_MS_THRESHOLD", 100),
            mode_error_count_threshold: env_var("CCC_MODE_ERROR_COUNT_THRESHOLD", 10),
            mode_error_window: Duration::from_secs(env_var("CCC_MODE_ERROR_WINDOW_S", 300)),

            shadow_sample_rate: env_var("CCC_SHADOW_SAMPLE_RATE", 0.10),
            shadow_path_timeout: Duration::from_secs(env_var("CCC_SHADOW_PATH_TIMEOUT_S", 5)),
            shadow_ring_capacity: env_var("CCC_SHADOW_RING_CAPACITY", 1000),

            heartbeat_period: Duration::from_secs(env_var("CCC_HEARTBEAT_PERIOD_S", 30)),
            aggregate_health_period: Duration::from_secs(env_var("CCC_AGGREGATE_HEALTH_PERIOD_S", 60)),
            instance_stale_after: Duration::from_secs(env_var("CCC_INSTANCE_STALE_AFTER_S", 300)),
            instance_health_ttl: Duration::from_secs(env_var("CCC_INSTANCE_HEALTH_TTL_S", 300)),

            sla_ring_capacity: env_var("CCC_SLA_RING_CAPACITY", 1000),
            sla_invalidation_completion_s: (30.0, 45.0),
            sla_hit_rate: (0.95, 0.90),
            sla_coordination_latency_ms: env_var("CCC_SLA_COORDINATION_LATENCY_MS", 100.0),
            sla_stale_recovery_s: (5.0, 10.0),
            sla_selective_efficiency: env_var("CCC_SLA_SELECTIVE_EFFICIENCY", 0.80),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_concurrent_families, 5);
        assert_eq!(cfg.max_concurrent_indicator_tasks, 3);
        assert_eq!(cfg.invalidation_batch_size, 1000);
        assert_eq!(cfg.greeks_bulk_threshold, 5);
        assert!((cfg.mode_match_rate_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(cfg.shadow_ring_capacity, 1000);
        assert_eq!(cfg.sla_ring_capacity, 1000);
    }
}
