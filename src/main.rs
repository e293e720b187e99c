//! Binary entry point: wires the Store, Chain Reader, Applier, Orchestrator,
//! Enricher, Maintenance and Scheduler together, then runs forever.

use std::sync::Arc;

use anyhow::{Context, Result};
use polymarket_indexer::applier::EventApplier;
use polymarket_indexer::chain::{self, CONDITIONAL_TOKENS_EVENTS, CTF_EXCHANGE_EVENTS};
use polymarket_indexer::config::Config;
use polymarket_indexer::enrich::Enricher;
use polymarket_indexer::maintenance::Maintenance;
use polymarket_indexer::orchestrator::{Orchestrator, SubIndexer};
use polymarket_indexer::scheduler::Scheduler;
use polymarket_indexer::store::{SqliteStore, Store};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("configuration invalid, refusing to start")?;
    init_tracing(&config.log_level);

    info!(
        polygon_rpc_url = %config.polygon_rpc_url,
        start_block = config.start_block,
        batch_size = config.batch_size,
        "polymarket indexer starting"
    );

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.database_url).context("failed to open store")?,
    );

    let chain_reader = chain::reader::connect(&config.polygon_rpc_url, config.max_retry_attempts)
        .await
        .context("failed to connect to Polygon RPC")?;
    let chain_reader: Arc<dyn chain::ChainReader> = Arc::new(chain_reader);

    let applier = EventApplier::new(store.clone(), config.collateral_token_address.clone());

    let orchestrator = Orchestrator::new(
        store.clone(),
        chain_reader.clone(),
        applier,
        config.start_block,
        config.batch_size,
    );

    let sub_indexers = vec![
        SubIndexer {
            name: "conditional_tokens",
            contract: config.conditional_tokens_address.parse().context(
                "CONDITIONAL_TOKENS_ADDRESS failed to parse as an address at startup",
            )?,
            event_names: CONDITIONAL_TOKENS_EVENTS,
        },
        SubIndexer {
            name: "ctf_exchange",
            contract: config
                .ctf_exchange_address
                .parse()
                .context("CTF_EXCHANGE_ADDRESS failed to parse as an address at startup")?,
            event_names: CTF_EXCHANGE_EVENTS,
        },
    ];

    let enricher = Enricher::new(
        store.clone(),
        config.polymarket_api_url.clone(),
        config.query_timeout,
    );
    let maintenance = Maintenance::new(
        store.clone(),
        config.price_history_retention_days,
        config.event_log_retention_days,
    );

    let scheduler = Scheduler::new(
        orchestrator,
        sub_indexers,
        enricher,
        maintenance,
        config.indexer_interval_minutes,
        config.trigger_immediate,
    );

    let handles = scheduler.spawn();
    for handle in handles {
        handle.await.context("a scheduler job loop panicked")?;
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("polymarket_indexer={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
