//! Domain entities persisted by the Store.
//!
//! Monetary and share amounts are `rust_decimal::Decimal` throughout; binary
//! floating point is reserved for the statistics layer (momentum,
//! volatility) where bounded error is acceptable.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub gas_used: u64,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    pub condition_id: String,
    pub oracle: String,
    pub question_id: String,
    pub outcome_slot_count: u32,
    pub created_at_block: u64,
    pub created_at_tx: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at_block: Option<u64>,
    pub resolved_at_tx: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub payout_numerators: Option<Vec<u64>>,
    pub question: Option<String>,
    pub description: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub resolution_source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PositionToken {
    pub position_id: String,
    pub condition_id: String,
    pub outcome_index: u32,
    pub token_id: Option<String>,
}

impl PositionToken {
    pub fn derive_position_id(condition_id: &str, outcome_index: u32) -> String {
        format!("{condition_id}_{outcome_index}")
    }
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub block_timestamp: i64,
    pub exchange_address: String,
    pub trader: String,
    pub token_id: String,
    pub collateral_token: String,
    pub token_amount: Decimal,
    pub collateral_amount: Decimal,
    pub price: Decimal,
    pub is_buy: bool,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub user: String,
    pub token_id: String,
    pub balance: Decimal,
    pub last_updated_block: u64,
    pub last_updated_tx: String,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserMarketPosition {
    pub user: String,
    pub condition_id: String,
    pub outcome_index: u32,
    pub total_shares_bought: Decimal,
    pub total_shares_sold: Decimal,
    pub current_shares: Decimal,
    pub total_cost_basis: Decimal,
    pub total_proceeds: Decimal,
    pub average_buy_price: Decimal,
    pub realized_pnl: Decimal,
    pub first_trade_at: DateTime<Utc>,
    pub last_trade_at: DateTime<Utc>,
}

impl UserMarketPosition {
    pub fn new(
        user: String,
        condition_id: String,
        outcome_index: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user,
            condition_id,
            outcome_index,
            total_shares_bought: Decimal::ZERO,
            total_shares_sold: Decimal::ZERO,
            current_shares: Decimal::ZERO,
            total_cost_basis: Decimal::ZERO,
            total_proceeds: Decimal::ZERO,
            average_buy_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            first_trade_at: now,
            last_trade_at: now,
        }
    }

    /// Unrealized PnL against the current market price (query-time only, not stored).
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        self.current_shares * (current_price - self.average_buy_price)
    }

    /// Outcome 0 is priced at `yes_price`, every other outcome at `no_price` —
    /// the binary-market assumption `MarketMetrics` itself already makes.
    pub fn current_price(&self, metrics: &MarketMetrics) -> Decimal {
        if self.outcome_index == 0 {
            metrics.yes_price
        } else {
            metrics.no_price
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserStats {
    pub user: String,
    pub total_volume: Decimal,
    pub total_trades: u64,
    pub first_trade_at: DateTime<Utc>,
    pub last_trade_at: DateTime<Utc>,
}

/// Combined realized (stored) and unrealized (query-time) PnL for a user on
/// a condition, summed across whichever outcome positions they hold.
#[derive(Debug, Clone)]
pub struct UserConditionPnl {
    pub user: String,
    pub condition_id: String,
    pub current_shares: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone)]
pub struct PriceHistoryTick {
    pub id: Option<i64>,
    pub condition_id: String,
    pub outcome_index: u32,
    pub block_number: u64,
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MarketMetrics {
    pub condition_id: String,
    pub volume_1h: Decimal,
    pub volume_4h: Decimal,
    pub volume_12h: Decimal,
    pub volume_24h: Decimal,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub yes_price_12h_ago: Decimal,
    pub yes_price_24h_ago: Decimal,
    pub price_12h_change_pct: f64,
    pub price_24h_change_pct: f64,
    pub total_liquidity: Decimal,
    pub open_interest: Decimal,
    pub trade_count_24h: u64,
    pub unique_traders_24h: u64,
    pub price_momentum: f64,
    pub volume_momentum: f64,
    pub turnover_ratio: f64,
    pub adjusted_volatility: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexerStatus {
    Idle,
    Running,
    Error,
}

impl IndexerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexerStatus::Idle => "IDLE",
            IndexerStatus::Running => "RUNNING",
            IndexerStatus::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "RUNNING" => IndexerStatus::Running,
            "ERROR" => IndexerStatus::Error,
            _ => IndexerStatus::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerState {
    pub name: String,
    pub last_processed_block: u64,
    pub status: IndexerStatus,
    pub error_message: Option<String>,
    pub total_events_processed: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventLogRow {
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub contract_address: String,
    pub event_name: String,
    pub event_args_json: String,
    pub processed: bool,
}

/// Off-chain market descriptor returned by the external REST catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogDescriptor {
    pub condition_id: String,
    pub question: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub end_date_iso: Option<String>,
    pub image: Option<String>,
    /// Position-token ids in outcome order, e.g. `["<yes_id>", "<no_id>"]`.
    /// The catalog serves this field as a JSON-encoded string rather than a
    /// native array; `deserialize_clob_token_ids` unwraps either shape.
    #[serde(default, deserialize_with = "deserialize_clob_token_ids")]
    pub clob_token_ids: Option<Vec<String>>,
}

fn deserialize_clob_token_ids<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Array(Vec<String>),
        EncodedString(String),
    }

    match Option::<Flexible>::deserialize(deserializer)? {
        Some(Flexible::Array(ids)) => Ok(Some(ids)),
        Some(Flexible::EncodedString(s)) => Ok(Some(serde_json::from_str(&s).unwrap_or_default())),
        None => Ok(None),
    }
}
