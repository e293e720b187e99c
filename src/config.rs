//! Process-wide configuration, loaded once at startup.
//!
//! Mirrors the source stack's `Config::from_env` shape: read every knob from
//! the environment with a documented default, then validate the handful of
//! values that are unsafe to get wrong (addresses, ranges, URLs). Validation
//! failures are `Fatal-config` errors — the process refuses to start rather
//! than run with a guessed value.

use anyhow::{bail, Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub polygon_rpc_url: String,
    pub start_block: u64,
    pub batch_size: u64,
    pub conditional_tokens_address: String,
    pub ctf_exchange_address: String,
    pub neg_risk_adapter_address: String,
    pub collateral_token_address: String,
    pub indexer_interval_minutes: u64,
    pub trigger_immediate: bool,
    pub max_retry_attempts: u32,
    pub connection_pool_size: u32,
    pub query_timeout: Duration,
    pub price_history_retention_days: i64,
    pub event_log_retention_days: i64,
    pub polymarket_api_url: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "./polymarket_indexer.db".to_string());

        let redis_url = std::env::var("REDIS_URL").ok();

        let polygon_rpc_url = std::env::var("POLYGON_RPC_URL")
            .context("POLYGON_RPC_URL must be set")?;

        let start_block = parse_env_default("START_BLOCK", 50_000_000u64)?;
        let batch_size = parse_env_default("BATCH_SIZE", 100u64)?;

        let conditional_tokens_address = std::env::var("CONDITIONAL_TOKENS_ADDRESS")
            .context("CONDITIONAL_TOKENS_ADDRESS must be set")?;
        let ctf_exchange_address = std::env::var("CTF_EXCHANGE_ADDRESS")
            .context("CTF_EXCHANGE_ADDRESS must be set")?;
        let neg_risk_adapter_address = std::env::var("NEG_RISK_ADAPTER_ADDRESS")
            .unwrap_or_else(|_| "0x0000000000000000000000000000000000000000".to_string());
        let collateral_token_address = std::env::var("COLLATERAL_TOKEN_ADDRESS")
            .unwrap_or_else(|_| "0x2791bca1f2de4661ed88a30c99a7a9449aa84174".to_string());

        let indexer_interval_minutes = parse_env_default("INDEXER_INTERVAL_MINUTES", 5u64)?;
        let trigger_immediate = std::env::var("TRIGGER_IMMEDIATE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let max_retry_attempts = parse_env_default("MAX_RETRY_ATTEMPTS", 3u32)?;
        let connection_pool_size = parse_env_default("CONNECTION_POOL_SIZE", 20u32)?;
        let query_timeout_secs = parse_env_default("QUERY_TIMEOUT", 60u64)?;
        let price_history_retention_days = parse_env_default("PRICE_HISTORY_RETENTION_DAYS", 90i64)?;
        let event_log_retention_days = parse_env_default("EVENT_LOG_RETENTION_DAYS", 30i64)?;

        let polymarket_api_url = std::env::var("POLYMARKET_API_URL")
            .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let config = Self {
            database_url,
            redis_url,
            polygon_rpc_url,
            start_block,
            batch_size,
            conditional_tokens_address,
            ctf_exchange_address,
            neg_risk_adapter_address,
            collateral_token_address,
            indexer_interval_minutes,
            trigger_immediate,
            max_retry_attempts,
            connection_pool_size,
            query_timeout: Duration::from_secs(query_timeout_secs),
            price_history_retention_days,
            event_log_retention_days,
            polymarket_api_url,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.polygon_rpc_url, "POLYGON_RPC_URL")?;
        validate_url(&self.polymarket_api_url, "POLYMARKET_API_URL")?;

        validate_address(&self.conditional_tokens_address, "CONDITIONAL_TOKENS_ADDRESS")?;
        validate_address(&self.ctf_exchange_address, "CTF_EXCHANGE_ADDRESS")?;
        validate_address(&self.neg_risk_adapter_address, "NEG_RISK_ADAPTER_ADDRESS")?;
        validate_address(&self.collateral_token_address, "COLLATERAL_TOKEN_ADDRESS")?;

        if !(1..=10_000).contains(&self.batch_size) {
            bail!("BATCH_SIZE must be in 1..=10000, got {}", self.batch_size);
        }
        if !(1..=60).contains(&self.indexer_interval_minutes) {
            bail!(
                "INDEXER_INTERVAL_MINUTES must be in 1..=60, got {}",
                self.indexer_interval_minutes
            );
        }
        if self.max_retry_attempts == 0 {
            bail!("MAX_RETRY_ATTEMPTS must be at least 1");
        }

        Ok(())
    }
}

fn parse_env_default<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn validate_url(value: &str, field: &str) -> Result<()> {
    let Some((scheme, rest)) = value.split_once("://") else {
        bail!("{field} is missing a scheme: {value}");
    };
    if scheme.is_empty() || rest.is_empty() {
        bail!("{field} is not a well-formed URL: {value}");
    }
    Ok(())
}

fn validate_address(value: &str, field: &str) -> Result<()> {
    if value.len() != 42 || !value.starts_with("0x") {
        bail!("{field} must be a 42-character hex address, got {value:?}");
    }
    hex::decode(&value[2..]).with_context(|| format!("{field} is not valid hex: {value}"))?;
    Ok(())
}
