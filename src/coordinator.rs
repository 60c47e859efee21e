//! Coordinator (C7). Fans an incoming event out to its participant set,
//! collects per-participant results with full error isolation, and
//! records one SLA observation per dispatch. No participant failure is
//! ever allowed to propagate out of `dispatch` as a fatal error.

use crate::event::{CoordinationResult, Event, EventKind, MarketData, ParticipantResult};
use crate::greeks::{GreeksCacheManager, GreeksParams};
use crate::indicators::IndicatorCacheCoordinator;
use crate::invalidation::InvalidationEngine;
use crate::moneyness::{ChainInstrument, MoneynessRefreshService};
use crate::patterns;
use crate::sla::SlaMonitor;
use async_trait::async_trait;
use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Supplies chain-level data (instruments, greeks params) the Coordinator
/// needs for chain-rebalance events but does not own itself, mirroring the
/// `BarProvider`/`GreeksCalculator` pattern of delegating I/O and math to
/// injected collaborators.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn chain_instruments(&self, underlying: &str) -> anyhow::Result<Vec<ChainInstrument>>;
    async fn greeks_params(&self, underlying: &str) -> anyhow::Result<Vec<GreeksParams>>;
}

pub struct Coordinator {
    invalidation: Arc<InvalidationEngine>,
    greeks: Arc<GreeksCacheManager>,
    indicators: Arc<IndicatorCacheCoordinator>,
    moneyness: Arc<MoneynessRefreshService>,
    chain_provider: Arc<dyn ChainProvider>,
    sla: Arc<SlaMonitor>,
}

impl Coordinator {
    pub fn new(
        invalidation: Arc<InvalidationEngine>,
        greeks: Arc<GreeksCacheManager>,
        indicators: Arc<IndicatorCacheCoordinator>,
        moneyness: Arc<MoneynessRefreshService>,
        chain_provider: Arc<dyn ChainProvider>,
        sla: Arc<SlaMonitor>,
    ) -> Self {
        Self {
            invalidation,
            greeks,
            indicators,
            moneyness,
            chain_provider,
            sla,
        }
    }

    pub async fn dispatch(&self, event: &Event) -> CoordinationResult {
        let start = Instant::now();

        let handles: Vec<(&'static str, tokio::task::JoinHandle<ParticipantResult>)> = match event.kind {
            EventKind::InstrumentUpdate => {
                let id = event.entity_ref.as_str().to_string();
                let market_data = event.market_data.clone().unwrap_or_default();
                let event = event.clone();

                vec![
                    ("enhanced_cache", tokio::spawn(Self::run_enhanced_cache(self.invalidation.clone(), event))),
                    (
                        "greeks",
                        tokio::spawn(Self::run_greeks_instrument(self.greeks.clone(), id.clone(), market_data.clone())),
                    ),
                    (
                        "indicators",
                        tokio::spawn(Self::run_indicators(self.indicators.clone(), id.clone(), market_data.clone())),
                    ),
                    (
                        "moneyness",
                        tokio::spawn(Self::run_moneyness_instrument(
                            self.moneyness.clone(),
                            self.chain_provider.clone(),
                            id,
                            market_data,
                        )),
                    ),
                ]
            }
            EventKind::ChainRebalance => {
                let underlying = event.entity_ref.as_str().to_string();
                let event = event.clone();

                vec![
                    ("enhanced_cache", tokio::spawn(Self::run_enhanced_cache(self.invalidation.clone(), event.clone()))),
                    (
                        "greeks",
                        tokio::spawn(Self::run_greeks_chain(self.greeks.clone(), self.chain_provider.clone(), underlying.clone())),
                    ),
                    (
                        "moneyness",
                        tokio::spawn(Self::run_moneyness_chain(self.moneyness.clone(), self.chain_provider.clone(), underlying, event)),
                    ),
                ]
            }
            EventKind::SubscriptionChange | EventKind::ExpiryRollover | EventKind::MarketClose | EventKind::CorporateAction => {
                let event = event.clone();
                vec![("enhanced_cache", tokio::spawn(Self::run_enhanced_cache(self.invalidation.clone(), event)))]
            }
        };

        let mut results = Vec::with_capacity(handles.len());
        for (participant, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(ParticipantResult {
                    participant: participant.to_string(),
                    success: false,
                    detail: format!("panicked: {join_err}"),
                    invalidated_keys: 0,
                }),
            }
        }

        let participants_attempted = results.len();
        let participants_succeeded = results.iter().filter(|r| r.success).count();
        let aggregate_invalidated_keys = results.iter().map(|r| r.invalidated_keys).sum();
        let duration_ms = start.elapsed().as_millis() as u64;

        self.sla
            .record_coordination_latency("coordinator", duration_ms as f64)
            .await;

        CoordinationResult {
            participants_attempted,
            participants_succeeded,
            per_participant_results: results,
            duration_ms,
            aggregate_invalidated_keys,
        }
    }

    async fn run_enhanced_cache(invalidation: Arc<InvalidationEngine>, event: Event) -> ParticipantResult {
        let hour = Utc::now().hour();
        let spec = patterns::derive(&event, false, hour);
        let result = invalidation.invalidate(&spec).await;
        ParticipantResult {
            participant: "enhanced_cache".to_string(),
            success: result.is_success(),
            detail: format!("{} families touched", result.families_touched.len()),
            invalidated_keys: result.invalidated_keys,
        }
    }

    async fn run_greeks_instrument(greeks: Arc<GreeksCacheManager>, id: String, market_data: MarketData) -> ParticipantResult {
        match greeks.on_instrument_update(&id, &market_data).await {
            Ok(outcome) => ParticipantResult {
                participant: "greeks".to_string(),
                success: true,
                detail: format!("recalculated={}", outcome.recalculated),
                invalidated_keys: outcome.invalidated_keys,
            },
            Err(err) => ParticipantResult {
                participant: "greeks".to_string(),
                success: false,
                detail: err.to_string(),
                invalidated_keys: 0,
            },
        }
    }

    async fn run_greeks_chain(greeks: Arc<GreeksCacheManager>, chain_provider: Arc<dyn ChainProvider>, underlying: String) -> ParticipantResult {
        let params = match chain_provider.greeks_params(&underlying).await {
            Ok(p) => p,
            Err(err) => {
                return ParticipantResult {
                    participant: "greeks".to_string(),
                    success: false,
                    detail: err.to_string(),
                    invalidated_keys: 0,
                }
            }
        };
        match greeks.on_chain_rebalance(&underlying, &params).await {
            Ok(outcome) => ParticipantResult {
                participant: "greeks".to_string(),
                success: true,
                detail: format!("recalculated={} instruments={}", outcome.recalculated, params.len()),
                invalidated_keys: outcome.invalidated_keys,
            },
            Err(err) => ParticipantResult {
                participant: "greeks".to_string(),
                success: false,
                detail: err.to_string(),
                invalidated_keys: 0,
            },
        }
    }

    async fn run_indicators(indicators: Arc<IndicatorCacheCoordinator>, id: String, market_data: MarketData) -> ParticipantResult {
        match indicators.on_instrument_update(&id, &market_data, None).await {
            Ok((invalidated, pairs)) => ParticipantResult {
                participant: "indicators".to_string(),
                success: true,
                detail: format!("{} pairs recomputed", pairs.len()),
                invalidated_keys: invalidated,
            },
            Err(err) => ParticipantResult {
                participant: "indicators".to_string(),
                success: false,
                detail: err.to_string(),
                invalidated_keys: 0,
            },
        }
    }

    async fn run_moneyness_instrument(
        moneyness: Arc<MoneynessRefreshService>,
        chain_provider: Arc<dyn ChainProvider>,
        id: String,
        market_data: MarketData,
    ) -> ParticipantResult {
        let chain = match chain_provider.chain_instruments(&id).await {
            Ok(c) => c,
            Err(err) => {
                return ParticipantResult {
                    participant: "moneyness".to_string(),
                    success: false,
                    detail: err.to_string(),
                    invalidated_keys: 0,
                }
            }
        };
        let Some(new_spot) = market_data.spot else {
            return ParticipantResult {
                participant: "moneyness".to_string(),
                success: true,
                detail: "no spot in update".to_string(),
                invalidated_keys: 0,
            };
        };
        match moneyness.on_spot_update(&id, new_spot, market_data.previous_spot, &chain).await {
            Ok(outcome) => ParticipantResult {
                participant: "moneyness".to_string(),
                success: true,
                detail: format!("refresh_type={:?} strikes={}", outcome.refresh_type, outcome.strikes_refreshed),
                invalidated_keys: 0,
            },
            Err(err) => ParticipantResult {
                participant: "moneyness".to_string(),
                success: false,
                detail: err.to_string(),
                invalidated_keys: 0,
            },
        }
    }

    async fn run_moneyness_chain(
        moneyness: Arc<MoneynessRefreshService>,
        chain_provider: Arc<dyn ChainProvider>,
        underlying: String,
        event: Event,
    ) -> ParticipantResult {
        let chain = match chain_provider.chain_instruments(&underlying).await {
            Ok(c) => c,
            Err(err) => {
                return ParticipantResult {
                    participant: "moneyness".to_string(),
                    success: false,
                    detail: err.to_string(),
                    invalidated_keys: 0,
                }
            }
        };
        let new_spot = event.market_data.as_ref().and_then(|m| m.spot).unwrap_or(0.0);
        match moneyness.on_chain_rebalance(&underlying, new_spot, &chain).await {
            Ok(outcome) => ParticipantResult {
                participant: "moneyness".to_string(),
                success: true,
                detail: format!("refresh_type={:?} strikes={}", outcome.refresh_type, outcome.strikes_refreshed),
                invalidated_keys: 0,
            },
            Err(err) => ParticipantResult {
                participant: "moneyness".to_string(),
                success: false,
                detail: err.to_string(),
                invalidated_keys: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::event::EntityRef;
    use crate::greeks::{GreeksCalculator, GreeksValue};
    use crate::indicators::{Bar, BarProvider, IndicatorCalculator, IndicatorKind, TimeFrame};
    use crate::sla::SlaMonitor;
    use crate::store::{FakeStore, StoreAdapter};
    use std::collections::{BTreeMap, HashMap};

    struct StubGreeks;
    #[async_trait]
    impl GreeksCalculator for StubGreeks {
        async fn calculate_single(&self, _p: &GreeksParams) -> anyhow::Result<GreeksValue> {
            Ok(GreeksValue { delta: 0.5, gamma: 0.01, theta: -0.01, vega: 0.1, rho: 0.02 })
        }
        async fn calculate_bulk(&self, params: &[GreeksParams]) -> anyhow::Result<HashMap<String, GreeksValue>> {
            let mut out = HashMap::new();
            for p in params {
                out.insert(p.instrument_id.clone(), self.calculate_single(p).await?);
            }
            Ok(out)
        }
    }

    struct StubBars;
    #[async_trait]
    impl BarProvider for StubBars {
        async fn bars(&self, _id: &str, _tf: TimeFrame, _lookback: u32) -> anyhow::Result<Vec<Bar>> {
            Ok(vec![Bar::default(); 3])
        }
    }

    struct StubIndicatorCalc;
    #[async_trait]
    impl IndicatorCalculator for StubIndicatorCalc {
        async fn calc(&self, _kind: IndicatorKind, _bars: &[Bar], _params: &BTreeMap<String, String>) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    struct StubChainProvider;
    #[async_trait]
    impl ChainProvider for StubChainProvider {
        async fn chain_instruments(&self, _underlying: &str) -> anyhow::Result<Vec<ChainInstrument>> {
            Ok(vec![])
        }
        async fn greeks_params(&self, _underlying: &str) -> anyhow::Result<Vec<GreeksParams>> {
            Ok(vec![])
        }
    }

    fn build() -> Coordinator {
        let store: Arc<dyn StoreAdapter> = Arc::new(FakeStore::new());
        let config = Arc::new(CoreConfig::default());
        let invalidation = Arc::new(InvalidationEngine::new(store.clone(), config.max_concurrent_families, config.invalidation_batch_size));
        let greeks = Arc::new(GreeksCacheManager::new(store.clone(), Arc::new(StubGreeks), invalidation.clone(), config.clone()));
        let indicators = Arc::new(IndicatorCacheCoordinator::new(store.clone(), Arc::new(StubBars), Arc::new(StubIndicatorCalc), invalidation.clone(), config.clone()));
        let moneyness = Arc::new(MoneynessRefreshService::new(store.clone(), config.clone()));
        let sla = Arc::new(SlaMonitor::new(config.clone()));
        Coordinator::new(invalidation, greeks, indicators, moneyness, Arc::new(StubChainProvider), sla)
    }

    #[tokio::test]
    async fn instrument_update_runs_four_participants() {
        let coordinator = build();
        let event = Event::new(EventKind::InstrumentUpdate, EntityRef::Instrument("NSE:RELIANCE".into()))
            .with_market_data(MarketData { spot: Some(2445.0), previous_spot: Some(2440.0), implied_vol: Some(0.18), ..Default::default() });
        let result = coordinator.dispatch(&event).await;
        assert_eq!(result.participants_attempted, 4);
        assert!(result.coordination_success());
    }

    #[tokio::test]
    async fn subscription_change_runs_one_participant() {
        let coordinator = build();
        let event = Event::new(EventKind::SubscriptionChange, EntityRef::User("u-123".into()));
        let result = coordinator.dispatch(&event).await;
        assert_eq!(result.participants_attempted, 1);
        assert_eq!(result.per_participant_results[0].participant, "enhanced_cache");
    }
}
