//! Cache Coordination Core binary.
//!
//! Wires the store adapter, every C1-C12 component, and two kinds of
//! background loops (event consumption, instance heartbeat/aggregate
//! health) together, then runs until a shutdown signal is observed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use signal_cache_core::config::{self, CoreConfig};
use signal_cache_core::consumer::EventConsumer;
use signal_cache_core::coordinator::{ChainProvider, Coordinator};
use signal_cache_core::greeks::{GreeksCacheManager, GreeksCalculator, GreeksParams, GreeksValue};
use signal_cache_core::indicators::{Bar, BarProvider, IndicatorCacheCoordinator, IndicatorCalculator, IndicatorKind, TimeFrame};
use signal_cache_core::invalidation::InvalidationEngine;
use signal_cache_core::mode::IntegrationModeMachine;
use signal_cache_core::moneyness::{ChainInstrument, MoneynessRefreshService};
use signal_cache_core::registry::InstanceRegistry;
use signal_cache_core::shadow::{LookupBackend, ResultExtractor, ShadowComparator};
use signal_cache_core::sla::SlaMonitor;
use signal_cache_core::store::{FakeStore, RedisStore, StoreAdapter};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Real-time signal cache coordination daemon.
#[derive(Parser, Debug)]
#[command(name = "signal-cache-core", version)]
struct Cli {
    /// Redis/store connection URL. Falls back to an in-memory store when absent.
    #[arg(long, env = "CCC_REDIS_URL")]
    redis_url: Option<String>,

    /// Upstream event stream key.
    #[arg(long, env = "CCC_EVENT_STREAM", default_value = "signal_service:events")]
    event_stream: String,

    /// Consumer group name for the event stream.
    #[arg(long, env = "CCC_EVENT_GROUP", default_value = "cache_coordination")]
    event_group: String,

    /// Prometheus metrics listener address.
    #[arg(long, env = "CCC_METRICS_ADDR", default_value = "0.0.0.0:9898")]
    metrics_addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    config::load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(CoreConfig::default());

    PrometheusBuilder::new()
        .with_http_listener(cli.metrics_addr.parse::<std::net::SocketAddr>().context("invalid metrics address")?)
        .install()
        .context("failed to install Prometheus exporter")?;

    let store: Arc<dyn StoreAdapter> = match &cli.redis_url {
        Some(url) => {
            info!(url = %url, "connecting to Redis-backed store");
            Arc::new(RedisStore::connect(url).await.context("failed to connect to Redis")?)
        }
        None => {
            warn!("no CCC_REDIS_URL set, running with an in-memory store (development mode)");
            Arc::new(FakeStore::new())
        }
    };

    let sla = Arc::new(SlaMonitor::new(config.clone()));
    let mode = Arc::new(IntegrationModeMachine::new(config.clone(), sla.clone()));

    let invalidation = Arc::new(InvalidationEngine::new(
        store.clone(),
        config.max_concurrent_families,
        config.invalidation_batch_size,
    ));
    let greeks = Arc::new(GreeksCacheManager::new(
        store.clone(),
        Arc::new(UnimplementedGreeksCalculator),
        invalidation.clone(),
        config.clone(),
    ));
    let indicators = Arc::new(IndicatorCacheCoordinator::new(
        store.clone(),
        Arc::new(UnimplementedBarProvider),
        Arc::new(UnimplementedIndicatorCalculator),
        invalidation.clone(),
        config.clone(),
    ));
    let moneyness = Arc::new(MoneynessRefreshService::new(store.clone(), config.clone()));
    let chain_provider: Arc<dyn ChainProvider> = Arc::new(UnimplementedChainProvider);

    let coordinator = Arc::new(Coordinator::new(
        invalidation,
        greeks,
        indicators,
        moneyness,
        chain_provider,
        sla.clone(),
    ));

    // Shadow comparison serves lookup APIs, not the event stream below; a
    // deployment exposing such an API would hold onto this and call
    // `lookup()` from its handlers.
    let _shadow = Arc::new(ShadowComparator::new(
        Arc::new(LegacyLookupUnavailable),
        Arc::new(LegacyLookupUnavailable),
        Arc::new(IdSetExtractor),
        mode,
        config.clone(),
    ));

    let registry = Arc::new(InstanceRegistry::new(store.clone(), sla.clone(), config.clone()));
    let consumer = EventConsumer::new(
        store.clone(),
        coordinator,
        sla.clone(),
        cli.event_stream,
        cli.event_group,
        registry.instance_id().to_string(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let heartbeat_registry = registry.clone();
    let heartbeat_shutdown = shutdown_rx.clone();
    let heartbeat_handle = tokio::spawn(async move { heartbeat_registry.run_heartbeat_loop(heartbeat_shutdown).await });

    let aggregate_registry = registry.clone();
    let aggregate_shutdown = shutdown_rx.clone();
    let aggregate_handle = tokio::spawn(async move { aggregate_registry.run_aggregate_health_loop(aggregate_shutdown).await });

    let consumer_shutdown = shutdown_rx.clone();
    let consumer_handle = tokio::spawn(async move { consumer.run(consumer_shutdown).await });

    info!(instance_id = registry.instance_id(), "cache coordination core started");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
    info!("shutdown signal received, stopping background loops");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(heartbeat_handle, aggregate_handle, consumer_handle);
    info!("shutdown complete");

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_cache_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// The core orchestrates recomputation but never performs the math itself
/// (the pluggable-calculator boundary). These stand in until a deployment
/// wires in its own pricing/analytics service.
struct UnimplementedGreeksCalculator;

#[async_trait]
impl GreeksCalculator for UnimplementedGreeksCalculator {
    async fn calculate_single(&self, params: &GreeksParams) -> anyhow::Result<GreeksValue> {
        Err(anyhow::anyhow!(
            "no Greeks calculator configured for instrument {}",
            params.instrument_id
        ))
    }

    async fn calculate_bulk(&self, params: &[GreeksParams]) -> anyhow::Result<HashMap<String, GreeksValue>> {
        Err(anyhow::anyhow!("no Greeks calculator configured for {} instruments", params.len()))
    }
}

struct UnimplementedBarProvider;

#[async_trait]
impl BarProvider for UnimplementedBarProvider {
    async fn bars(&self, instrument_id: &str, _timeframe: TimeFrame, _lookback: u32) -> anyhow::Result<Vec<Bar>> {
        Err(anyhow::anyhow!("no bar provider configured for {instrument_id}"))
    }
}

struct UnimplementedIndicatorCalculator;

#[async_trait]
impl IndicatorCalculator for UnimplementedIndicatorCalculator {
    async fn calc(&self, kind: IndicatorKind, _bars: &[Bar], _params: &BTreeMap<String, String>) -> anyhow::Result<serde_json::Value> {
        Err(anyhow::anyhow!("no indicator calculator configured for {}", kind.as_str()))
    }
}

struct UnimplementedChainProvider;

#[async_trait]
impl ChainProvider for UnimplementedChainProvider {
    async fn chain_instruments(&self, underlying: &str) -> anyhow::Result<Vec<ChainInstrument>> {
        Err(anyhow::anyhow!("no chain provider configured for {underlying}"))
    }

    async fn greeks_params(&self, underlying: &str) -> anyhow::Result<Vec<GreeksParams>> {
        Err(anyhow::anyhow!("no chain provider configured for {underlying}"))
    }
}

struct LegacyLookupUnavailable;

#[async_trait]
impl LookupBackend for LegacyLookupUnavailable {
    async fn lookup(&self, query: &str) -> anyhow::Result<serde_json::Value> {
        Err(anyhow::anyhow!("no lookup backend configured for query {query}"))
    }
}

struct IdSetExtractor;

impl ResultExtractor for IdSetExtractor {
    fn extract_ids(&self, result: &serde_json::Value) -> HashSet<String> {
        result
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }
}
