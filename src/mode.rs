//! Integration Mode Machine (C9). Tri-state {disabled, shadow, active}
//! with table-driven transitions. Reads are lock-free via `ArcSwap` so
//! lookup APIs never block on a mode check.

use crate::config::CoreConfig;
use crate::event::IntegrationMode;
use crate::sla::SlaMonitor;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Closed set of transition triggers. Dispatch stays reason-tagged rather
/// than re-deriving the trigger from raw counters at the call site.
#[derive(Debug, Clone)]
pub enum ModeTrigger {
    ShadowModeSuccess { match_rate: f64, p95_latency_ms: f64 },
    RegistryFailures,
    CircuitBreakerOpenPersistent,
    Operator { to: IntegrationMode, reason: String },
}

struct ModeMetrics {
    error_events: VecDeque<Instant>,
}

impl ModeMetrics {
    fn new() -> Self {
        Self {
            error_events: VecDeque::new(),
        }
    }

    fn record_error(&mut self) {
        self.error_events.push_back(Instant::now());
    }

    fn error_count_within(&mut self, window: std::time::Duration) -> u32 {
        let cutoff = Instant::now().checked_sub(window).unwrap_or_else(Instant::now);
        while matches!(self.error_events.front(), Some(t) if *t < cutoff) {
            self.error_events.pop_front();
        }
        self.error_events.len() as u32
    }

    fn reset(&mut self) -> usize {
        let count = self.error_events.len();
        self.error_events.clear();
        count
    }
}

pub struct IntegrationModeMachine {
    mode: ArcSwap<IntegrationMode>,
    metrics: Mutex<ModeMetrics>,
    config: Arc<CoreConfig>,
    sla: Arc<SlaMonitor>,
}

impl IntegrationModeMachine {
    pub fn new(config: Arc<CoreConfig>, sla: Arc<SlaMonitor>) -> Self {
        Self {
            mode: ArcSwap::from_pointee(IntegrationMode::default()),
            metrics: Mutex::new(ModeMetrics::new()),
            config,
            sla,
        }
    }

    /// Lock-free read of the current mode, safe to call on every lookup.
    pub fn current(&self) -> IntegrationMode {
        **self.mode.load()
    }

    async fn switch_to(&self, to: IntegrationMode, reason: &str) {
        let from = self.current();
        if from == to {
            return;
        }
        let prior_errors = self.metrics.lock().reset();
        info!(from = ?from, to = ?to, reason, prior_error_events = prior_errors, "integration mode switch");
        self.mode.store(Arc::new(to));
        self.sla.record_mode_switch("integration_mode", &format!("{from:?}->{to:?} ({reason})")).await;
    }

    /// Evaluates one trigger against the current mode and applies the
    /// resulting transition, if any. Returns the mode after evaluation.
    pub async fn consider_transition(&self, trigger: ModeTrigger) -> IntegrationMode {
        let current = self.current();
        match &trigger {
            ModeTrigger::ShadowModeSuccess { match_rate, p95_latency_ms } => {
                if current == IntegrationMode::Shadow
                    && *match_rate >= self.config.mode_match_rate_threshold
                    && *p95_latency_ms < self.config.mode_p95_latency_ms_threshold as f64
                {
                    self.switch_to(IntegrationMode::Active, "shadow_mode_success").await;
                }
            }
            ModeTrigger::RegistryFailures => {
                let count = {
                    let mut metrics = self.metrics.lock();
                    metrics.record_error();
                    metrics.error_count_within(self.config.mode_error_window)
                };
                if current == IntegrationMode::Active && count > self.config.mode_error_count_threshold {
                    self.switch_to(IntegrationMode::Shadow, "registry_failures").await;
                }
            }
            ModeTrigger::CircuitBreakerOpenPersistent => {
                if current != IntegrationMode::Disabled {
                    self.switch_to(IntegrationMode::Disabled, "circuit_breaker_open_persistent").await;
                }
            }
            ModeTrigger::Operator { to, reason } => {
                self.switch_to(*to, reason).await;
            }
        }
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> IntegrationModeMachine {
        let config = Arc::new(CoreConfig::default());
        let sla = Arc::new(SlaMonitor::new(config.clone()));
        IntegrationModeMachine::new(config, sla)
    }

    #[tokio::test]
    async fn starts_in_shadow() {
        let m = machine();
        assert_eq!(m.current(), IntegrationMode::Shadow);
    }

    #[tokio::test]
    async fn shadow_success_promotes_to_active() {
        let m = machine();
        m.consider_transition(ModeTrigger::ShadowModeSuccess { match_rate: 0.97, p95_latency_ms: 50.0 }).await;
        assert_eq!(m.current(), IntegrationMode::Active);
    }

    #[tokio::test]
    async fn insufficient_match_rate_stays_shadow() {
        let m = machine();
        m.consider_transition(ModeTrigger::ShadowModeSuccess { match_rate: 0.80, p95_latency_ms: 50.0 }).await;
        assert_eq!(m.current(), IntegrationMode::Shadow);
    }

    #[tokio::test]
    async fn circuit_breaker_forces_disabled_from_any_state() {
        let m = machine();
        m.consider_transition(ModeTrigger::ShadowModeSuccess { match_rate: 0.97, p95_latency_ms: 50.0 }).await;
        assert_eq!(m.current(), IntegrationMode::Active);
        m.consider_transition(ModeTrigger::CircuitBreakerOpenPersistent).await;
        assert_eq!(m.current(), IntegrationMode::Disabled);
    }

    #[tokio::test]
    async fn operator_switch_always_applies() {
        let m = machine();
        m.consider_transition(ModeTrigger::Operator { to: IntegrationMode::Disabled, reason: "maintenance".into() }).await;
        assert_eq!(m.current(), IntegrationMode::Disabled);
    }

    #[tokio::test]
    async fn more_than_ten_errors_in_active_demotes_to_shadow() {
        let m = machine();
        m.consider_transition(ModeTrigger::ShadowModeSuccess { match_rate: 0.97, p95_latency_ms: 50.0 }).await;
        assert_eq!(m.current(), IntegrationMode::Active);
        for _ in 0..11 {
            m.consider_transition(ModeTrigger::RegistryFailures).await;
        }
        assert_eq!(m.current(), IntegrationMode::Shadow);
    }
}
