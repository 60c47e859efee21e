//! SLA Monitor (C12). Records typed observations, counts violations
//! against configured thresholds, and exposes a compliance summary.
//! Violations are both kept in a bounded ring (for recency-scoped
//! summaries) and accumulated into Prometheus-style counters that persist
//! across ring eviction.

use crate::config::CoreConfig;
use crate::event::{Severity, SLAKind, SLAObservation};
use crate::telemetry::histogram::LatencyHistogram;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

pub struct SlaMonitor {
    config: Arc<CoreConfig>,
    ring: Mutex<VecDeque<SLAObservation>>,
    counters: Mutex<HashMap<(SlaKindKey, SeverityKey), u64>>,
    coordination_histogram: LatencyHistogram,
}

// `SLAKind`/`Severity` don't derive `Hash`; small local copies do, kept
// private so the public enums stay serde-focused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlaKindKey(u8);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SeverityKey(u8);

fn kind_key(kind: SLAKind) -> SlaKindKey {
    SlaKindKey(kind as u8)
}
fn severity_key(severity: Severity) -> SeverityKey {
    SeverityKey(severity as u8)
}

#[derive(Debug, Clone, Default)]
pub struct SlaSummary {
    pub violations_last_hour: HashMap<(SLAKind, Severity), u64>,
    pub total_violations: HashMap<(SLAKind, Severity), u64>,
    pub compliant: bool,
}

impl SlaMonitor {
    pub fn new(config: Arc<CoreConfig>) -> Self {
        Self {
            config,
            ring: Mutex::new(VecDeque::new()),
            counters: Mutex::new(HashMap::new()),
            coordination_histogram: LatencyHistogram::new(),
        }
    }

    fn push(&self, obs: SLAObservation) {
        metrics::counter!("sla_violations_total", "kind" => format!("{:?}", obs.kind), "severity" => format!("{:?}", obs.severity)).increment(1);
        warn!(kind = ?obs.kind, severity = ?obs.severity, actual = obs.actual, threshold = obs.threshold, "SLA violation recorded");

        let mut counters = self.counters.lock();
        *counters.entry((kind_key(obs.kind), severity_key(obs.severity))).or_insert(0) += 1;
        drop(counters);

        let mut ring = self.ring.lock();
        if ring.len() >= self.config.sla_ring_capacity {
            ring.pop_front();
        }
        ring.push_back(obs);
    }

    pub async fn record_invalidation_completion(&self, service: &str, duration_s: f64) {
        let (minor, major) = self.config.sla_invalidation_completion_s;
        let severity = if duration_s > major {
            Some(Severity::Major)
        } else if duration_s > minor {
            Some(Severity::Minor)
        } else {
            None
        };
        if let Some(severity) = severity {
            self.push(SLAObservation {
                kind: SLAKind::InvalidationCompletion,
                service: service.to_string(),
                threshold: minor,
                actual: duration_s,
                severity,
                at: Utc::now(),
            });
        }
    }

    pub async fn record_hit_rate(&self, service: &str, hit_rate: f64) {
        let (minor, major) = self.config.sla_hit_rate;
        let severity = if hit_rate < major {
            Some(Severity::Major)
        } else if hit_rate < minor {
            Some(Severity::Minor)
        } else {
            None
        };
        if let Some(severity) = severity {
            self.push(SLAObservation {
                kind: SLAKind::HitRate,
                service: service.to_string(),
                threshold: minor,
                actual: hit_rate,
                severity,
                at: Utc::now(),
            });
        }
    }

    /// Always feeds the p95 histogram; only emits an observation when a
    /// single sample exceeds 5x the target. p95 itself is read via
    /// `p95_latency_ms()`.
    pub async fn record_coordination_latency(&self, service: &str, latency_ms: f64) {
        self.coordination_histogram.record((latency_ms * 1000.0) as u64);
        metrics::histogram!("coordination_latency_ms").record(latency_ms);

        let threshold = self.config.sla_coordination_latency_ms;
        if latency_ms > threshold * 5.0 {
            self.push(SLAObservation {
                kind: SLAKind::CoordinationLatencyExtreme,
                service: service.to_string(),
                threshold,
                actual: latency_ms,
                severity: Severity::Critical,
                at: Utc::now(),
            });
        }
    }

    pub fn p95_coordination_latency_ms(&self) -> f64 {
        self.coordination_histogram.p95() as f64 / 1000.0
    }

    pub async fn record_stale_recovery(&self, service: &str, duration_s: f64) {
        let (major, critical) = self.config.sla_stale_recovery_s;
        let severity = if duration_s > critical {
            Some(Severity::Critical)
        } else if duration_s > major {
            Some(Severity::Major)
        } else {
            None
        };
        if let Some(severity) = severity {
            self.push(SLAObservation {
                kind: SLAKind::StaleRecovery,
                service: service.to_string(),
                threshold: major,
                actual: duration_s,
                severity,
                at: Utc::now(),
            });
        }
    }

    pub async fn record_selective_efficiency(&self, service: &str, efficiency: f64) {
        if efficiency < self.config.sla_selective_efficiency {
            self.push(SLAObservation {
                kind: SLAKind::SelectiveEfficiency,
                service: service.to_string(),
                threshold: self.config.sla_selective_efficiency,
                actual: efficiency,
                severity: Severity::Minor,
                at: Utc::now(),
            });
        }
    }

    pub async fn record_mode_switch(&self, service: &str, from_to: &str) {
        self.push(SLAObservation {
            kind: SLAKind::ModeSwitch,
            service: service.to_string(),
            threshold: 0.0,
            actual: 0.0,
            severity: Severity::Minor,
            at: Utc::now(),
        });
        tracing::info!(transition = from_to, "mode switch recorded");
    }

    pub fn summary(&self) -> SlaSummary {
        let now = Utc::now();
        let ring = self.ring.lock();
        let mut violations_last_hour: HashMap<(SLAKind, Severity), u64> = HashMap::new();
        for obs in ring.iter() {
            if (now - obs.at).num_seconds() <= 3600 {
                *violations_last_hour.entry((obs.kind, obs.severity)).or_insert(0) += 1;
            }
        }
        drop(ring);

        let counters = self.counters.lock();
        let mut total_violations = HashMap::new();
        for (kind, count) in counters.iter() {
            // best-effort reverse mapping; only used for summary display
            total_violations.insert((kind_to_enum(kind.0 .0), severity_to_enum(kind.1 .0)), *count);
        }
        drop(counters);

        let compliant = violations_last_hour
            .iter()
            .all(|((_, severity), _)| *severity == Severity::Minor);

        SlaSummary {
            violations_last_hour,
            total_violations,
            compliant,
        }
    }
}

fn kind_to_enum(v: u8) -> SLAKind {
    match v {
        0 => SLAKind::InvalidationCompletion,
        1 => SLAKind::HitRate,
        2 => SLAKind::CoordinationLatency,
        3 => SLAKind::StaleRecovery,
        4 => SLAKind::SelectiveEfficiency,
        5 => SLAKind::CoordinationLatencyExtreme,
        _ => SLAKind::ModeSwitch,
    }
}

fn severity_to_enum(v: u8) -> Severity {
    match v {
        0 => Severity::Minor,
        1 => Severity::Major,
        _ => Severity::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SlaMonitor {
        SlaMonitor::new(Arc::new(CoreConfig::default()))
    }

    #[tokio::test]
    async fn invalidation_completion_over_30s_counts_one_minor_violation() {
        let sla = monitor();
        sla.record_invalidation_completion("coordinator", 31.0).await;
        let summary = sla.summary();
        assert_eq!(
            summary.violations_last_hour.get(&(SLAKind::InvalidationCompletion, Severity::Minor)),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn invalidation_completion_over_45s_is_major() {
        let sla = monitor();
        sla.record_invalidation_completion("coordinator", 46.0).await;
        let summary = sla.summary();
        assert_eq!(
            summary.violations_last_hour.get(&(SLAKind::InvalidationCompletion, Severity::Major)),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn within_sla_records_nothing() {
        let sla = monitor();
        sla.record_invalidation_completion("coordinator", 5.0).await;
        sla.record_hit_rate("coordinator", 0.99).await;
        let summary = sla.summary();
        assert!(summary.violations_last_hour.is_empty());
        assert!(summary.compliant);
    }

    #[tokio::test]
    async fn extreme_coordination_latency_is_critical() {
        let sla = monitor();
        sla.record_coordination_latency("coordinator", 600.0).await; // 6x default 100ms
        let summary = sla.summary();
        assert_eq!(
            summary.violations_last_hour.get(&(SLAKind::CoordinationLatencyExtreme, Severity::Critical)),
            Some(&1)
        );
    }
}
