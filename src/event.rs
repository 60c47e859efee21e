//! Core data model: the entities described in the data-model section of
//! the coordination design, shared by every component. Types here carry no
//! behavior beyond construction helpers and serde derives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upstream event kinds. Closed set: new kinds require an explicit
/// handler registration in the Coordinator, not a generic fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstrumentUpdate,
    ChainRebalance,
    SubscriptionChange,
    ExpiryRollover,
    MarketClose,
    CorporateAction,
}

/// The subject of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum EntityRef {
    Instrument(String),
    Underlying(String),
    User(String),
}

impl EntityRef {
    pub fn as_str(&self) -> &str {
        match self {
            EntityRef::Instrument(s) | EntityRef::Underlying(s) | EntityRef::User(s) => s,
        }
    }
}

/// Option type, carried through market data when relevant to Greeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

/// Market-data payload attached to update events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    pub spot: Option<f64>,
    pub previous_spot: Option<f64>,
    pub volume: Option<f64>,
    pub previous_volume: Option<f64>,
    pub implied_vol: Option<f64>,
    pub previous_implied_vol: Option<f64>,
    pub time_to_expiry_days: Option<f64>,
    pub option_type: Option<OptionType>,
}

/// Immutable record produced by the event consumer from a stream entry.
/// Lives from `StreamRead` to the end of `Coordinator::dispatch`; never
/// persisted by the core itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub entity_ref: EntityRef,
    pub market_data: Option<MarketData>,
    pub metadata: BTreeMap<String, String>,
    /// Affected expiries for chain rebalances (empty otherwise).
    #[serde(default)]
    pub affected_expiries: Vec<String>,
}

impl Event {
    pub fn new(kind: EventKind, entity_ref: EntityRef) -> Self {
        Self {
            kind,
            entity_ref,
            market_data: None,
            metadata: BTreeMap::new(),
            affected_expiries: Vec::new(),
        }
    }

    pub fn with_market_data(mut self, market_data: MarketData) -> Self {
        self.market_data = Some(market_data);
        self
    }

    pub fn with_affected_expiries(mut self, expiries: Vec<String>) -> Self {
        self.affected_expiries = expiries;
        self
    }
}

/// Closed family taxonomy for cache key namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Greeks,
    Indicators,
    Moneyness,
    MarketData,
    UserData,
    ChainData,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Greeks => "greeks",
            Family::Indicators => "indicators",
            Family::Moneyness => "moneyness",
            Family::MarketData => "market_data",
            Family::UserData => "user_data",
            Family::ChainData => "chain_data",
        }
    }
}

/// Ordered mapping `family -> glob patterns`, derived purely from
/// `(event.kind, entity_ref, selective)` by the Pattern Registry. Insertion
/// order is preserved (drives C3's per-family worker scheduling order).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSpec {
    entries: Vec<(Family, Vec<String>)>,
}

impl PatternSpec {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, family: Family, patterns: Vec<String>) {
        self.entries.push((family, patterns));
    }

    pub fn families(&self) -> impl Iterator<Item = Family> + '_ {
        self.entries.iter().map(|(f, _)| *f)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Family, Vec<String>)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff every pattern in `other` is also present in `self` for the
    /// corresponding family. Used to check the "selective narrows full"
    /// round-trip law.
    pub fn is_superset_of(&self, other: &PatternSpec) -> bool {
        other.entries.iter().all(|(fam, pats)| {
            self.entries
                .iter()
                .find(|(f, _)| f == fam)
                .map(|(_, self_pats)| pats.iter().all(|p| self_pats.contains(p)))
                .unwrap_or(false)
        })
    }
}

/// Result of running an `Invalidate` call against the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidationResult {
    pub invalidated_keys: u64,
    pub families_touched: Vec<Family>,
    pub duration_ms: u64,
    pub partial_failures: Vec<Family>,
    pub fatal: Option<String>,
}

impl InvalidationResult {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }
}

/// Freshness decision inputs/outputs computed by C4/C5/C6 from a cached
/// snapshot plus new market data.
#[derive(Debug, Clone, Default)]
pub struct FreshnessContext {
    pub spot_change_pct: f64,
    pub vol_change_pct: f64,
    pub time_to_expiry_days: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub cache_age_s: f64,
    pub delta_change: Option<f64>,

    pub recalc_required: bool,
    pub expiry_approaching: bool,
    pub volume_spike: bool,
}

/// The envelope every cache entry is required to carry; the core reads
/// only `timestamp`, everything else passes through opaque to the
/// calculator that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

/// Aggregate outcome of fanning one event out to its participant set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationResult {
    pub participants_attempted: usize,
    pub participants_succeeded: usize,
    pub per_participant_results: Vec<ParticipantResult>,
    pub duration_ms: u64,
    pub aggregate_invalidated_keys: u64,
}

impl CoordinationResult {
    pub fn coordination_success(&self) -> bool {
        self.participants_succeeded > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantResult {
    pub participant: String,
    pub success: bool,
    pub detail: String,
    pub invalidated_keys: u64,
}

/// One shadow-mode comparison between the registry path and the legacy
/// path, kept in C10's bounded ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowObservation {
    pub query: String,
    pub registry_result: Option<serde_json::Value>,
    pub legacy_result: Option<serde_json::Value>,
    pub results_match: bool,
    pub registry_latency_ms: u64,
    pub legacy_latency_ms: u64,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Instance status computed from its own load metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadMetrics {
    pub cpu_pct: f64,
    pub rss_mb: f64,
    pub connections: u64,
    pub threads: u64,
    pub requests_per_minute: f64,
    pub queue_depth: u64,
    pub processing_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub pid: u32,
    pub host: String,
    pub status: InstanceStatus,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub load_metrics: LoadMetrics,
    pub load_score: f64,
    pub coordination_score: f64,
    pub assigned_entities: Vec<String>,
}

/// SLA observation kinds, a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SLAKind {
    InvalidationCompletion,
    HitRate,
    CoordinationLatency,
    StaleRecovery,
    SelectiveEfficiency,
    CoordinationLatencyExtreme,
    ModeSwitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SLAObservation {
    pub kind: SLAKind,
    pub service: String,
    pub threshold: f64,
    pub actual: f64,
    pub severity: Severity,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Tri-state integration mode. Initial value is `Shadow` per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMode {
    Disabled,
    Shadow,
    Active,
}

impl Default for IntegrationMode {
    fn default() -> Self {
        IntegrationMode::Shadow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_spec_superset_check() {
        let mut full = PatternSpec::new();
        full.push(Family::Greeks, vec!["greeks:X:*".into()]);
        let mut selective = PatternSpec::new();
        selective.push(Family::Greeks, vec!["greeks:X:*:current".into()]);

        // selective as written narrows via suffix, so full must NOT contain
        // the suffixed pattern verbatim; the superset check is over
        // patterns literally present, demonstrating the two specs differ.
        assert!(!full.is_superset_of(&selective));
    }

    #[test]
    fn entity_ref_as_str() {
        let e = EntityRef::Instrument("NSE:RELIANCE".to_string());
        assert_eq!(e.as_str(), "NSE:RELIANCE");
    }
}
