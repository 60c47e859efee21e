//! Greeks Cache Manager (C4). Decides whether cached Greeks for an
//! instrument are stale relative to new market data, selectively
//! invalidates the right subfamilies, and dispatches recomputation to an
//! injected `GreeksCalculator`.

use crate::config::CoreConfig;
use crate::event::{CacheEntry, Family, FreshnessContext, MarketData, PatternSpec};
use crate::invalidation::InvalidationEngine;
use crate::store::StoreAdapter;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeksParams {
    pub instrument_id: String,
    pub spot: f64,
    pub implied_vol: f64,
    pub time_to_expiry_days: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeksValue {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

/// Pluggable math. The core never computes Greeks itself; it orchestrates
/// invalidation and recomputation only.
#[async_trait]
pub trait GreeksCalculator: Send + Sync {
    async fn calculate_single(&self, params: &GreeksParams) -> anyhow::Result<GreeksValue>;
    async fn calculate_bulk(&self, params: &[GreeksParams]) -> anyhow::Result<HashMap<String, GreeksValue>>;
}

/// The schema C4 itself writes into `greeks:{id}:latest`'s payload. Opaque
/// to everyone else, but C4 reads its own shape back to derive the next
/// `FreshnessContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GreeksSnapshot {
    spot: f64,
    vol: f64,
    time_to_expiry_days: Option<f64>,
    delta: f64,
    gamma: f64,
}

#[derive(Debug, Clone)]
pub struct GreeksOutcome {
    pub cache_invalidated: bool,
    pub invalidated_keys: u64,
    pub recalculated: bool,
    pub tags: Vec<&'static str>,
    pub priority_high: bool,
}

pub struct GreeksCacheManager {
    store: Arc<dyn StoreAdapter>,
    calculator: Arc<dyn GreeksCalculator>,
    invalidation: Arc<InvalidationEngine>,
    config: Arc<CoreConfig>,
}

impl GreeksCacheManager {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        calculator: Arc<dyn GreeksCalculator>,
        invalidation: Arc<InvalidationEngine>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            store,
            calculator,
            invalidation,
            config,
        }
    }

    async fn fetch_prev(&self, id: &str) -> Option<(GreeksSnapshot, chrono::DateTime<Utc>)> {
        let raw = self.store.get(&format!("greeks:{id}:latest")).await.ok()?;
        let entry: CacheEntry = serde_json::from_slice(&raw).ok()?;
        let snapshot: GreeksSnapshot = serde_json::from_value(entry.payload).ok()?;
        Some((snapshot, entry.timestamp))
    }

    fn should_recalc(
        &self,
        prev: Option<&(GreeksSnapshot, chrono::DateTime<Utc>)>,
        market_data: &MarketData,
        now: chrono::DateTime<Utc>,
    ) -> (FreshnessContext, Vec<&'static str>) {
        let cfg = &self.config;
        let mut ctx = FreshnessContext::default();
        let mut tags = Vec::new();

        let Some((snapshot, prev_ts)) = prev else {
            ctx.recalc_required = true;
            return (ctx, tags);
        };

        let spot = market_data.spot.unwrap_or(snapshot.spot);
        ctx.spot_change_pct = if snapshot.spot != 0.0 {
            ((spot - snapshot.spot) / snapshot.spot).abs() * 100.0
        } else {
            0.0
        };
        let vol = market_data.implied_vol.unwrap_or(snapshot.vol);
        ctx.vol_change_pct = if snapshot.vol != 0.0 {
            ((vol - snapshot.vol) / snapshot.vol).abs() * 100.0
        } else {
            0.0
        };
        ctx.time_to_expiry_days = market_data.time_to_expiry_days;
        ctx.cache_age_s = (now - *prev_ts).num_milliseconds() as f64 / 1000.0;

        if ctx.spot_change_pct > cfg.greeks_spot_change_pct {
            tags.push("spot");
        }
        if ctx.vol_change_pct > cfg.greeks_vol_change_pct {
            tags.push("vol");
        }
        if let Some(days) = ctx.time_to_expiry_days {
            if days < cfg.greeks_expiry_days {
                tags.push("expiry_approaching");
                ctx.expiry_approaching = true;
            }
        }
        if ctx.cache_age_s > cfg.greeks_live_ttl.as_secs_f64() {
            tags.push("stale");
        }
        // First-order local estimate of the delta move implied by this spot
        // change, using the gamma cached alongside the last computed delta:
        // delta_change ~= gamma * (spot - prev_spot).
        let delta_change = snapshot.gamma * (spot - snapshot.spot);
        ctx.delta_change = Some(delta_change);
        if delta_change.abs() > cfg.greeks_delta_threshold {
            tags.push("delta_shift");
        }

        ctx.recalc_required = !tags.is_empty();
        (ctx, tags)
    }

    fn selective_keys(&self, id: &str, tags: &[&str]) -> Vec<String> {
        let mut keys = Vec::new();
        for tag in tags {
            match *tag {
                "spot" => {
                    keys.push(format!("greeks:{id}:delta:*"));
                    keys.push(format!("greeks:{id}:gamma:*"));
                }
                "vol" => {
                    keys.push(format!("greeks:{id}:sensitivity:*"));
                    keys.push(format!("greeks:{id}:scenarios:*"));
                }
                "expiry_approaching" => {
                    keys.push(format!("greeks:{id}:theta:*"));
                    keys.push(format!("greeks:{id}:time_series:*"));
                }
                _ => {}
            }
        }
        keys.push(format!("greeks:{id}:live"));
        keys.push(format!("greeks:{id}:current"));
        keys
    }

    async fn write_result(&self, id: &str, params: &GreeksParams, value: &GreeksValue) -> anyhow::Result<()> {
        let now = Utc::now();
        let snapshot = GreeksSnapshot {
            spot: params.spot,
            vol: params.implied_vol,
            time_to_expiry_days: params.time_to_expiry_days,
            delta: value.delta,
            gamma: value.gamma,
        };
        let payload = serde_json::to_value(&snapshot)?;
        let entry = CacheEntry {
            timestamp: now,
            payload,
        };
        let bytes = serde_json::to_vec(&entry)?;

        self.store
            .set_with_ttl(&format!("greeks:{id}:latest"), &bytes, self.config.greeks_live_ttl)
            .await?;
        self.store
            .set_with_ttl(&format!("greeks:{id}:current"), &bytes, self.config.greeks_live_ttl)
            .await?;
        self.store
            .set_with_ttl(
                &format!("greeks:{id}:timestamp:{}", now.timestamp()),
                &bytes,
                std::time::Duration::from_secs(86_400 * 365),
            )
            .await?;
        Ok(())
    }

    pub async fn on_instrument_update(&self, id: &str, market_data: &MarketData) -> anyhow::Result<GreeksOutcome> {
        let now = Utc::now();
        let prev = self.fetch_prev(id).await;
        let (ctx, tags) = self.should_recalc(prev.as_ref(), market_data, now);

        let mut outcome = GreeksOutcome {
            cache_invalidated: false,
            invalidated_keys: 0,
            recalculated: false,
            tags: tags.clone(),
            priority_high: ctx.expiry_approaching,
        };

        if !ctx.recalc_required {
            return Ok(outcome);
        }

        let keys = self.selective_keys(id, &tags);
        let mut spec = PatternSpec::new();
        spec.push(Family::Greeks, keys);
        let invalidation_result = self.invalidation.invalidate(&spec).await;
        outcome.cache_invalidated = true;
        outcome.invalidated_keys = invalidation_result.invalidated_keys;

        let params = GreeksParams {
            instrument_id: id.to_string(),
            spot: market_data.spot.unwrap_or(0.0),
            implied_vol: market_data.implied_vol.unwrap_or(0.0),
            time_to_expiry_days: market_data.time_to_expiry_days,
        };
        let value = self.calculator.calculate_single(&params).await?;
        self.write_result(id, &params, &value).await?;
        outcome.recalculated = true;

        Ok(outcome)
    }

    pub async fn on_chain_rebalance(&self, underlying: &str, instruments: &[GreeksParams]) -> anyhow::Result<GreeksOutcome> {
        let mut keys = Vec::new();
        keys.push(format!("greeks:chain:{underlying}:*"));
        keys.push(format!("greeks:bulk:{underlying}:*"));
        let mut spec = PatternSpec::new();
        spec.push(Family::Greeks, keys);
        let invalidation_result = self.invalidation.invalidate(&spec).await;

        let values = if instruments.len() > self.config.greeks_bulk_threshold {
            self.calculator.calculate_bulk(instruments).await?
        } else {
            let mut out = HashMap::new();
            for params in instruments {
                out.insert(params.instrument_id.clone(), self.calculator.calculate_single(params).await?);
            }
            out
        };

        for params in instruments {
            if let Some(value) = values.get(&params.instrument_id) {
                self.write_result(&params.instrument_id, params, value).await?;
            }
        }

        Ok(GreeksOutcome {
            cache_invalidated: true,
            invalidated_keys: invalidation_result.invalidated_keys,
            recalculated: true,
            tags: vec![],
            priority_high: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;

    struct StubCalculator;

    #[async_trait]
    impl GreeksCalculator for StubCalculator {
        async fn calculate_single(&self, params: &GreeksParams) -> anyhow::Result<GreeksValue> {
            Ok(GreeksValue {
                delta: 0.5,
                gamma: 0.01,
                theta: -0.02,
                vega: 0.1,
                rho: 0.03,
            })
        }

        async fn calculate_bulk(&self, params: &[GreeksParams]) -> anyhow::Result<HashMap<String, GreeksValue>> {
            let mut out = HashMap::new();
            for p in params {
                out.insert(p.instrument_id.clone(), self.calculate_single(p).await?);
            }
            Ok(out)
        }
    }

    fn manager() -> GreeksCacheManager {
        let store: Arc<dyn StoreAdapter> = Arc::new(FakeStore::new());
        let config = Arc::new(CoreConfig::default());
        let invalidation = Arc::new(InvalidationEngine::new(
            store.clone(),
            config.max_concurrent_families,
            config.invalidation_batch_size,
        ));
        GreeksCacheManager::new(store, Arc::new(StubCalculator), invalidation, config)
    }

    #[tokio::test]
    async fn first_update_always_recalculates() {
        let mgr = manager();
        let md = MarketData {
            spot: Some(2445.0),
            implied_vol: Some(0.18),
            ..Default::default()
        };
        let outcome = mgr.on_instrument_update("NSE:RELIANCE", &md).await.unwrap();
        assert!(outcome.recalculated);
    }

    #[tokio::test]
    async fn small_move_below_threshold_does_not_recalc() {
        let mgr = manager();
        let md = MarketData {
            spot: Some(2440.0),
            implied_vol: Some(0.18),
            ..Default::default()
        };
        mgr.on_instrument_update("NSE:RELIANCE", &md).await.unwrap();

        let md2 = MarketData {
            spot: Some(2445.0), // 0.2% move
            implied_vol: Some(0.18),
            ..Default::default()
        };
        let outcome = mgr.on_instrument_update("NSE:RELIANCE", &md2).await.unwrap();
        assert!(!outcome.cache_invalidated);
        assert!(!outcome.recalculated);
    }

    #[tokio::test]
    async fn move_above_threshold_invalidates_delta_and_gamma() {
        let mgr = manager();
        let md = MarketData {
            spot: Some(2440.0),
            implied_vol: Some(0.18),
            ..Default::default()
        };
        mgr.on_instrument_update("NSE:RELIANCE", &md).await.unwrap();

        let md2 = MarketData {
            spot: Some(2469.28), // 1.2% move
            implied_vol: Some(0.18),
            ..Default::default()
        };
        let outcome = mgr.on_instrument_update("NSE:RELIANCE", &md2).await.unwrap();
        assert!(outcome.cache_invalidated);
        assert!(outcome.tags.contains(&"spot"));
        assert!(outcome.recalculated);
    }

    struct GammaCalculator {
        gamma: f64,
    }

    #[async_trait]
    impl GreeksCalculator for GammaCalculator {
        async fn calculate_single(&self, _params: &GreeksParams) -> anyhow::Result<GreeksValue> {
            Ok(GreeksValue {
                delta: 0.5,
                gamma: self.gamma,
                theta: -0.02,
                vega: 0.1,
                rho: 0.03,
            })
        }

        async fn calculate_bulk(&self, params: &[GreeksParams]) -> anyhow::Result<HashMap<String, GreeksValue>> {
            let mut out = HashMap::new();
            for p in params {
                out.insert(p.instrument_id.clone(), self.calculate_single(p).await?);
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn high_gamma_triggers_delta_shift_below_spot_threshold() {
        let store: Arc<dyn StoreAdapter> = Arc::new(FakeStore::new());
        let config = Arc::new(CoreConfig::default());
        let invalidation = Arc::new(InvalidationEngine::new(
            store.clone(),
            config.max_concurrent_families,
            config.invalidation_batch_size,
        ));
        let mgr = GreeksCacheManager::new(store, Arc::new(GammaCalculator { gamma: 0.02 }), invalidation, config);

        let md = MarketData {
            spot: Some(2440.0),
            implied_vol: Some(0.18),
            ..Default::default()
        };
        mgr.on_instrument_update("NSE:RELIANCE", &md).await.unwrap();

        let md2 = MarketData {
            spot: Some(2445.0), // 0.2% move, below the spot threshold
            implied_vol: Some(0.18),
            ..Default::default()
        };
        let outcome = mgr.on_instrument_update("NSE:RELIANCE", &md2).await.unwrap();
        assert!(!outcome.tags.contains(&"spot"));
        assert!(outcome.tags.contains(&"delta_shift"));
        assert!(outcome.recalculated);
    }
}
