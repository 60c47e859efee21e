//! Moneyness Refresh Service (C6). On spot-price moves or chain
//! rebalances, picks affected strikes (selective vs. full-chain) and
//! recomputes moneyness and category indexes.

use crate::config::CoreConfig;
use crate::event::{CacheEntry, OptionType};
use crate::store::StoreAdapter;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneynessCategory {
    DeepOtm,
    Otm,
    Atm,
    Itm,
    DeepItm,
}

impl MoneynessCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoneynessCategory::DeepOtm => "deep_otm",
            MoneynessCategory::Otm => "otm",
            MoneynessCategory::Atm => "atm",
            MoneynessCategory::Itm => "itm",
            MoneynessCategory::DeepItm => "deep_itm",
        }
    }

    pub fn classify(moneyness: f64) -> Self {
        if moneyness < 0.8 {
            MoneynessCategory::DeepOtm
        } else if moneyness < 0.95 {
            MoneynessCategory::Otm
        } else if moneyness <= 1.05 {
            MoneynessCategory::Atm
        } else if moneyness <= 1.2 {
            MoneynessCategory::Itm
        } else {
            MoneynessCategory::DeepItm
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainInstrument {
    pub strike: f64,
    pub expiry: String,
    pub option_type: OptionType,
    pub premium: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MoneynessSnapshot {
    moneyness: f64,
    category: MoneynessCategory,
    intrinsic_value: f64,
    time_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshType {
    ThresholdNotMet,
    Selective,
    FullChain,
}

#[derive(Debug, Clone)]
pub struct MoneynessOutcome {
    pub refresh_type: RefreshType,
    pub strikes_refreshed: usize,
}

pub struct MoneynessRefreshService {
    store: Arc<dyn StoreAdapter>,
    config: Arc<CoreConfig>,
}

fn intrinsic_value(spot: f64, strike: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

impl MoneynessRefreshService {
    pub fn new(store: Arc<dyn StoreAdapter>, config: Arc<CoreConfig>) -> Self {
        Self { store, config }
    }

    fn affected_strikes<'a>(
        &self,
        new_spot: f64,
        delta_pct: f64,
        chain: &'a [ChainInstrument],
    ) -> Vec<&'a ChainInstrument> {
        let lower_bound = new_spot * (1.0 - delta_pct / 200.0);
        let upper_bound = new_spot * (1.0 + delta_pct / 200.0);
        chain
            .iter()
            .filter(|inst| {
                let in_band = inst.strike >= lower_bound && inst.strike <= upper_bound;
                let atm = inst.strike != 0.0 && {
                    let ratio = new_spot / inst.strike;
                    (0.95..=1.05).contains(&ratio)
                };
                in_band || atm
            })
            .collect()
    }

    async fn refresh_strike(&self, underlying: &str, new_spot: f64, inst: &ChainInstrument) -> anyhow::Result<()> {
        let moneyness = if inst.strike != 0.0 { new_spot / inst.strike } else { 0.0 };
        let category = MoneynessCategory::classify(moneyness);
        let intrinsic = intrinsic_value(new_spot, inst.strike, inst.option_type);
        let time_value = inst.premium.map(|p| (p - intrinsic).max(0.0));

        let snapshot = MoneynessSnapshot {
            moneyness,
            category,
            intrinsic_value: intrinsic,
            time_value,
        };
        let entry = CacheEntry {
            timestamp: Utc::now(),
            payload: serde_json::to_value(&snapshot)?,
        };
        let bytes = serde_json::to_vec(&entry)?;

        let strike_key = format!("moneyness:{underlying}:{}:latest", format_strike(inst.strike));
        self.store.set_with_ttl(&strike_key, &bytes, Duration::from_secs(60)).await?;

        let category_key = format!("moneyness_category:{underlying}:{}:{}", inst.expiry, category.as_str());
        self.store
            .set_add(&category_key, &[format_strike(inst.strike)])
            .await?;
        self.store.expire(&category_key, Duration::from_secs(300)).await?;

        Ok(())
    }

    pub async fn on_spot_update(
        &self,
        underlying: &str,
        new_spot: f64,
        prev_spot: Option<f64>,
        chain: &[ChainInstrument],
    ) -> anyhow::Result<MoneynessOutcome> {
        let Some(prev) = prev_spot else {
            return self.full_chain_refresh(underlying, new_spot, chain).await;
        };
        if prev == 0.0 {
            return self.full_chain_refresh(underlying, new_spot, chain).await;
        }

        let delta_pct = ((new_spot - prev) / prev).abs() * 100.0;

        if delta_pct <= self.config.moneyness_noop_pct {
            return Ok(MoneynessOutcome {
                refresh_type: RefreshType::ThresholdNotMet,
                strikes_refreshed: 0,
            });
        }

        if delta_pct <= self.config.moneyness_full_refresh_pct {
            let affected = self.affected_strikes(new_spot, delta_pct, chain);
            for inst in &affected {
                self.refresh_strike(underlying, new_spot, inst).await?;
            }
            return Ok(MoneynessOutcome {
                refresh_type: RefreshType::Selective,
                strikes_refreshed: affected.len(),
            });
        }

        self.full_chain_refresh(underlying, new_spot, chain).await
    }

    async fn full_chain_refresh(
        &self,
        underlying: &str,
        new_spot: f64,
        chain: &[ChainInstrument],
    ) -> anyhow::Result<MoneynessOutcome> {
        for inst in chain {
            self.refresh_strike(underlying, new_spot, inst).await?;
        }
        Ok(MoneynessOutcome {
            refresh_type: RefreshType::FullChain,
            strikes_refreshed: chain.len(),
        })
    }

    pub async fn on_chain_rebalance(&self, underlying: &str, new_spot: f64, chain: &[ChainInstrument]) -> anyhow::Result<MoneynessOutcome> {
        self.full_chain_refresh(underlying, new_spot, chain).await
    }
}

fn format_strike(strike: f64) -> String {
    if strike.fract() == 0.0 {
        format!("{}", strike as i64)
    } else {
        format!("{strike}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;

    fn service() -> MoneynessRefreshService {
        MoneynessRefreshService::new(Arc::new(FakeStore::new()), Arc::new(CoreConfig::default()))
    }

    fn chain() -> Vec<ChainInstrument> {
        (2300..=2600)
            .step_by(50)
            .map(|k| ChainInstrument {
                strike: k as f64,
                expiry: "2024-12-26".to_string(),
                option_type: OptionType::Call,
                premium: Some(50.0),
            })
            .collect()
    }

    #[test]
    fn classify_bands() {
        assert_eq!(MoneynessCategory::classify(0.7), MoneynessCategory::DeepOtm);
        assert_eq!(MoneynessCategory::classify(0.9), MoneynessCategory::Otm);
        assert_eq!(MoneynessCategory::classify(1.0), MoneynessCategory::Atm);
        assert_eq!(MoneynessCategory::classify(1.1), MoneynessCategory::Itm);
        assert_eq!(MoneynessCategory::classify(1.3), MoneynessCategory::DeepItm);
    }

    #[tokio::test]
    async fn small_move_is_a_noop() {
        let svc = service();
        let outcome = svc.on_spot_update("NIFTY", 2441.0, Some(2440.0), &chain()).await.unwrap();
        assert_eq!(outcome.refresh_type, RefreshType::ThresholdNotMet);
        assert_eq!(outcome.strikes_refreshed, 0);
    }

    #[tokio::test]
    async fn moderate_move_is_selective() {
        let svc = service();
        let outcome = svc.on_spot_update("NIFTY", 2469.28, Some(2440.0), &chain()).await.unwrap();
        assert_eq!(outcome.refresh_type, RefreshType::Selective);
        assert!(outcome.strikes_refreshed > 0);
        assert!(outcome.strikes_refreshed < chain().len());
    }

    #[tokio::test]
    async fn large_move_is_full_chain() {
        let svc = service();
        let outcome = svc.on_spot_update("NIFTY", 2600.0, Some(2440.0), &chain()).await.unwrap();
        assert_eq!(outcome.refresh_type, RefreshType::FullChain);
        assert_eq!(outcome.strikes_refreshed, chain().len());
    }
}
