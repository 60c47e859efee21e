//! Indicator Cache Coordinator (C5). Maps a market-data delta to affected
//! `(indicator_kind, timeframe)` pairs, invalidates those keys, and
//! recomputes them in dependency order with bounded concurrency.

use crate::config::CoreConfig;
use crate::event::{CacheEntry, Family, MarketData, PatternSpec};
use crate::invalidation::InvalidationEngine;
use crate::store::StoreAdapter;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndicatorKind {
    MovingAverage,
    Volatility,
    BollingerBands,
    Rsi,
    Macd,
    Stochastic,
    VolumeProfile,
    Momentum,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::MovingAverage => "moving_average",
            IndicatorKind::Volatility => "volatility",
            IndicatorKind::BollingerBands => "bollinger_bands",
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::Macd => "macd",
            IndicatorKind::Stochastic => "stochastic",
            IndicatorKind::VolumeProfile => "volume_profile",
            IndicatorKind::Momentum => "momentum",
        }
    }

    /// Recomputation order, deterministic, respecting dependencies.
    pub fn priority_order() -> [IndicatorKind; 8] {
        [
            IndicatorKind::MovingAverage,
            IndicatorKind::Volatility,
            IndicatorKind::BollingerBands,
            IndicatorKind::Rsi,
            IndicatorKind::Macd,
            IndicatorKind::Stochastic,
            IndicatorKind::VolumeProfile,
            IndicatorKind::Momentum,
        ]
    }

    fn default_period(&self, timeframe: TimeFrame) -> u32 {
        let base = match self {
            IndicatorKind::MovingAverage => 20,
            IndicatorKind::Rsi => 14,
            IndicatorKind::BollingerBands => 20,
            IndicatorKind::Macd => 26,
            IndicatorKind::Stochastic => 14,
            IndicatorKind::Volatility => 20,
            IndicatorKind::VolumeProfile => 20,
            IndicatorKind::Momentum => 10,
        };
        match timeframe {
            TimeFrame::M1 | TimeFrame::M5 => (base / 2).max(5),
            TimeFrame::W1 => base * 2,
            _ => base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeFrame {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
    W1,
}

impl TimeFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M1 => "1m",
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::H1 => "1h",
            TimeFrame::H4 => "4h",
            TimeFrame::D1 => "1d",
            TimeFrame::W1 => "1w",
        }
    }

    pub fn ttl(&self) -> Duration {
        match self {
            TimeFrame::M1 => Duration::from_secs(60),
            TimeFrame::M5 => Duration::from_secs(300),
            TimeFrame::M15 => Duration::from_secs(900),
            TimeFrame::H1 => Duration::from_secs(3600),
            TimeFrame::H4 => Duration::from_secs(14_400),
            TimeFrame::D1 => Duration::from_secs(86_400),
            TimeFrame::W1 => Duration::from_secs(604_800),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bar {
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

#[async_trait]
pub trait BarProvider: Send + Sync {
    async fn bars(&self, instrument_id: &str, timeframe: TimeFrame, lookback: u32) -> anyhow::Result<Vec<Bar>>;
}

#[async_trait]
pub trait IndicatorCalculator: Send + Sync {
    async fn calc(&self, kind: IndicatorKind, bars: &[Bar], params: &BTreeMap<String, String>) -> anyhow::Result<serde_json::Value>;
}

/// Builds `param_signature = "k1_v1_k2_v2..."` with keys lexicographically
/// sorted, per the bit-exact key grammar.
fn param_signature(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}_{v}"))
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Default)]
pub struct IndicatorImpact {
    pub kinds: HashSet<IndicatorKind>,
    pub timeframes: HashSet<TimeFrame>,
}

pub struct IndicatorCacheCoordinator {
    store: Arc<dyn StoreAdapter>,
    bars: Arc<dyn BarProvider>,
    calculator: Arc<dyn IndicatorCalculator>,
    invalidation: Arc<InvalidationEngine>,
    config: Arc<CoreConfig>,
    semaphore: Arc<Semaphore>,
}

impl IndicatorCacheCoordinator {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        bars: Arc<dyn BarProvider>,
        calculator: Arc<dyn IndicatorCalculator>,
        invalidation: Arc<InvalidationEngine>,
        config: Arc<CoreConfig>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_indicator_tasks.max(1)));
        Self {
            store,
            bars,
            calculator,
            invalidation,
            config,
            semaphore,
        }
    }

    fn impact_analysis(&self, market_data: &MarketData, prev_volume: Option<f64>) -> IndicatorImpact {
        let cfg = &self.config;
        let mut impact = IndicatorImpact::default();

        let price_change_pct = match (market_data.spot, market_data.previous_spot) {
            (Some(spot), Some(prev)) if prev != 0.0 => ((spot - prev) / prev).abs() * 100.0,
            _ => 0.0,
        };

        let bands = cfg.indicator_price_band_pct;
        if price_change_pct >= bands[0] {
            impact.timeframes.extend([TimeFrame::M1, TimeFrame::M5]);
        }
        if price_change_pct >= bands[1] {
            impact.timeframes.extend([TimeFrame::M15, TimeFrame::H1]);
        }
        if price_change_pct >= bands[2] {
            impact.timeframes.extend([TimeFrame::H4, TimeFrame::D1]);
        }
        if price_change_pct >= bands[3] {
            impact.timeframes.insert(TimeFrame::W1);
        }

        let volume_ratio = match (market_data.volume, prev_volume) {
            (Some(vol), Some(prev)) if prev != 0.0 => Some(vol / prev),
            _ => None,
        };
        if let Some(ratio) = volume_ratio {
            if ratio > cfg.indicator_volume_spike_ratio {
                impact.kinds.extend([
                    IndicatorKind::VolumeProfile,
                    IndicatorKind::Rsi,
                    IndicatorKind::Stochastic,
                    IndicatorKind::Momentum,
                ]);
            }
        }

        let vol_change_pct = match (market_data.implied_vol, market_data.previous_implied_vol) {
            (Some(iv), Some(prev)) if prev != 0.0 => ((iv - prev) / prev).abs() * 100.0,
            _ => 0.0,
        };
        if vol_change_pct > cfg.indicator_vol_change_pct {
            impact.kinds.extend([IndicatorKind::Volatility, IndicatorKind::BollingerBands]);
        }

        // moving_average is the baseline trend indicator: any price move large
        // enough to touch a timeframe band keeps it in scope even when no
        // volume/vol trigger fired one of the other kinds.
        if price_change_pct >= bands[0] {
            impact.kinds.insert(IndicatorKind::MovingAverage);
        }

        impact
    }

    pub async fn on_instrument_update(
        &self,
        id: &str,
        market_data: &MarketData,
        prev_volume: Option<f64>,
    ) -> anyhow::Result<(u64, Vec<(IndicatorKind, TimeFrame)>)> {
        let impact = self.impact_analysis(market_data, prev_volume);
        if impact.timeframes.is_empty() {
            return Ok((0, Vec::new()));
        }

        let mut pairs = Vec::new();
        for kind in IndicatorKind::priority_order() {
            if !impact.kinds.contains(&kind) {
                continue;
            }
            for tf in &impact.timeframes {
                pairs.push((kind, *tf));
            }
        }

        let mut keys = Vec::with_capacity(pairs.len());
        for (kind, tf) in &pairs {
            keys.push(format!("indicators:{id}:{}:{}:*", kind.as_str(), tf.as_str()));
        }
        let mut spec = PatternSpec::new();
        spec.push(Family::Indicators, keys);
        let invalidation_result = self.invalidation.invalidate(&spec).await;

        let mut tasks = Vec::new();
        for (kind, tf) in pairs.iter().copied() {
            let store = self.store.clone();
            let bars_provider = self.bars.clone();
            let calculator = self.calculator.clone();
            let semaphore = self.semaphore.clone();
            let id = id.to_string();
            let period = kind.default_period(tf);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                recompute_one(store, bars_provider, calculator, &id, kind, tf, period).await
            }));
        }
        let _ = futures_util::future::join_all(tasks).await;

        Ok((invalidation_result.invalidated_keys, pairs))
    }
}

async fn recompute_one(
    store: Arc<dyn StoreAdapter>,
    bars: Arc<dyn BarProvider>,
    calculator: Arc<dyn IndicatorCalculator>,
    id: &str,
    kind: IndicatorKind,
    tf: TimeFrame,
    period: u32,
) -> anyhow::Result<()> {
    let history = bars.bars(id, tf, period).await?;
    let mut params = BTreeMap::new();
    params.insert("period".to_string(), period.to_string());
    let value = calculator.calc(kind, &history, &params).await?;

    let entry = CacheEntry {
        timestamp: Utc::now(),
        payload: value,
    };
    let bytes = serde_json::to_vec(&entry)?;
    let key = format!(
        "indicators:{id}:{}:{}:{}",
        kind.as_str(),
        tf.as_str(),
        param_signature(&params)
    );
    store.set_with_ttl(&key, &bytes, tf.ttl()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;

    struct StubBars;
    #[async_trait]
    impl BarProvider for StubBars {
        async fn bars(&self, _id: &str, _tf: TimeFrame, _lookback: u32) -> anyhow::Result<Vec<Bar>> {
            Ok(vec![Bar::default(); 5])
        }
    }

    struct StubCalc;
    #[async_trait]
    impl IndicatorCalculator for StubCalc {
        async fn calc(&self, _kind: IndicatorKind, _bars: &[Bar], _params: &BTreeMap<String, String>) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({"value": 1.0}))
        }
    }

    fn coordinator() -> IndicatorCacheCoordinator {
        let store: Arc<dyn StoreAdapter> = Arc::new(FakeStore::new());
        let config = Arc::new(CoreConfig::default());
        let invalidation = Arc::new(InvalidationEngine::new(
            store.clone(),
            config.max_concurrent_families,
            config.invalidation_batch_size,
        ));
        IndicatorCacheCoordinator::new(store, Arc::new(StubBars), Arc::new(StubCalc), invalidation, config)
    }

    #[tokio::test]
    async fn small_move_touches_only_short_timeframes() {
        let coord = coordinator();
        let md = MarketData {
            spot: Some(100.6),
            previous_spot: Some(100.0), // 0.6% move
            ..Default::default()
        };
        let (_, pairs) = coord.on_instrument_update("X", &md, None).await.unwrap();
        let tfs: HashSet<TimeFrame> = pairs.iter().map(|(_, tf)| *tf).collect();
        assert!(tfs.contains(&TimeFrame::M1));
        assert!(tfs.contains(&TimeFrame::M5));
        assert!(!tfs.contains(&TimeFrame::H4));
    }

    #[tokio::test]
    async fn large_move_reaches_weekly_timeframe() {
        let coord = coordinator();
        let md = MarketData {
            spot: Some(106.0),
            previous_spot: Some(100.0), // 6% move
            ..Default::default()
        };
        let (_, pairs) = coord.on_instrument_update("X", &md, None).await.unwrap();
        let tfs: HashSet<TimeFrame> = pairs.iter().map(|(_, tf)| *tf).collect();
        assert!(tfs.contains(&TimeFrame::W1));
    }

    #[tokio::test]
    async fn plain_price_move_only_affects_moving_average() {
        let coord = coordinator();
        let md = MarketData {
            spot: Some(2469.28),
            previous_spot: Some(2440.0), // 1.2% move, no volume/vol data
            ..Default::default()
        };
        let (_, pairs) = coord.on_instrument_update("X", &md, None).await.unwrap();
        let kinds: HashSet<IndicatorKind> = pairs.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(kinds, HashSet::from([IndicatorKind::MovingAverage]));
        let tfs: HashSet<TimeFrame> = pairs.iter().map(|(_, tf)| *tf).collect();
        assert_eq!(tfs, HashSet::from([TimeFrame::M1, TimeFrame::M5, TimeFrame::M15, TimeFrame::H1]));
    }

    #[tokio::test]
    async fn no_move_produces_no_pairs() {
        let coord = coordinator();
        let md = MarketData {
            spot: Some(100.0),
            previous_spot: Some(100.0),
            ..Default::default()
        };
        let (invalidated, pairs) = coord.on_instrument_update("X", &md, None).await.unwrap();
        assert_eq!(invalidated, 0);
        assert!(pairs.is_empty());
    }

    #[test]
    fn param_signature_is_sorted() {
        let mut params = BTreeMap::new();
        params.insert("period".to_string(), "14".to_string());
        params.insert("fast".to_string(), "12".to_string());
        assert_eq!(param_signature(&params), "fast_12_period_14");
    }
}
