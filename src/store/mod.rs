//! The Store: transactional persistence, upserts, aggregation queries, and
//! indexer-state bookkeeping.
//!
//! Defined as a trait so the Orchestrator can be constructed against an
//! in-memory implementation in tests, instead of reaching for a global
//! singleton connection.

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::models::{
    Block, CatalogDescriptor, Condition, EventLogRow, IndexerState, MarketMetrics,
    PositionToken, PriceHistoryTick, Trade, UserConditionPnl, UserMarketPosition, UserStats,
};

#[async_trait]
pub trait Store: Send + Sync {
    // -- Blocks & indexer state -------------------------------------------------
    async fn upsert_block(&self, block: &Block) -> Result<(), StoreError>;
    async fn get_indexer_state(&self, name: &str) -> Result<Option<IndexerState>, StoreError>;
    async fn update_indexer_state(
        &self,
        name: &str,
        last_processed_block: u64,
        events_processed_delta: u64,
    ) -> Result<(), StoreError>;
    async fn mark_indexer_error(&self, name: &str, message: &str) -> Result<(), StoreError>;
    async fn mark_indexer_idle(&self, name: &str) -> Result<(), StoreError>;

    // -- Conditions & position tokens --------------------------------------------
    async fn upsert_condition_on_preparation(&self, condition: &Condition) -> Result<(), StoreError>;
    async fn mark_condition_resolved(
        &self,
        condition_id: &str,
        payout_numerators: &[u64],
    ) -> Result<(), StoreError>;
    async fn get_condition(&self, condition_id: &str) -> Result<Option<Condition>, StoreError>;
    async fn find_position_token_by_token_id(
        &self,
        token_id: &str,
    ) -> Result<Option<PositionToken>, StoreError>;
    async fn backfill_position_token_id(
        &self,
        condition_id: &str,
        outcome_index: u32,
        token_id: &str,
    ) -> Result<(), StoreError>;

    // -- Balances & trades --------------------------------------------------------
    /// Records `(tx_hash, log_index)` as applied for a `TransferSingle` leg,
    /// mirroring `insert_trade_if_new`'s dedup. Returns `false` (already
    /// seen) on replay so the caller skips re-applying the balance delta.
    async fn insert_transfer_if_new(&self, tx_hash: &str, log_index: u64) -> Result<bool, StoreError>;
    async fn apply_balance_delta(
        &self,
        user: &str,
        token_id: &str,
        delta: Decimal,
        block: u64,
        tx_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn insert_trade_if_new(&self, trade: &Trade) -> Result<bool, StoreError>;
    async fn sum_positive_balances_for_condition(
        &self,
        condition_id: &str,
    ) -> Result<Decimal, StoreError>;

    // -- Derived state: positions, stats, price history --------------------------
    async fn get_user_market_position(
        &self,
        user: &str,
        condition_id: &str,
        outcome_index: u32,
    ) -> Result<Option<UserMarketPosition>, StoreError>;
    async fn upsert_user_market_position(
        &self,
        position: &UserMarketPosition,
    ) -> Result<(), StoreError>;
    async fn upsert_user_stats_on_trade(
        &self,
        user: &str,
        collateral_amount: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn insert_price_history_tick(&self, tick: &PriceHistoryTick) -> Result<(), StoreError>;
    async fn recent_trades_on_outcome(
        &self,
        condition_id: &str,
        outcome_index: u32,
        limit: usize,
    ) -> Result<Vec<Trade>, StoreError>;
    async fn windowed_volume(
        &self,
        condition_id: &str,
        since_ts: i64,
    ) -> Result<Decimal, StoreError>;
    async fn trade_count_since(&self, condition_id: &str, since_ts: i64) -> Result<u64, StoreError>;
    async fn unique_traders_since(
        &self,
        condition_id: &str,
        since_ts: i64,
    ) -> Result<u64, StoreError>;
    async fn upsert_market_metrics(&self, metrics: &MarketMetrics) -> Result<(), StoreError>;
    async fn get_market_metrics(&self, condition_id: &str) -> Result<Option<MarketMetrics>, StoreError>;

    // -- Conditions touched recently (drives the per-cycle metrics refresh) -----
    async fn conditions_traded_since(&self, since_ts: i64) -> Result<Vec<String>, StoreError>;

    // -- Enrichment ---------------------------------------------------------------
    async fn upsert_condition_metadata_coalesce(
        &self,
        descriptor: &CatalogDescriptor,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    // -- Maintenance ----------------------------------------------------------------
    async fn list_active_condition_ids(&self, limit: usize) -> Result<Vec<String>, StoreError>;
    async fn prune_price_history_older_than(&self, cutoff_ts: i64) -> Result<usize, StoreError>;
    async fn prune_event_log_older_than(&self, cutoff_ts: i64) -> Result<usize, StoreError>;
    async fn append_event_log(&self, row: &EventLogRow) -> Result<(), StoreError>;

    // -- Operator-facing outputs -----------------------------------------------------
    async fn get_active_markets(&self, limit: usize) -> Result<Vec<Condition>, StoreError>;
    async fn get_market_trades(&self, condition_id: &str, limit: usize) -> Result<Vec<Trade>, StoreError>;
    async fn get_indexer_stats(&self) -> Result<Vec<IndexerState>, StoreError>;
    async fn get_top_positions(
        &self,
        condition_id: &str,
        limit: usize,
    ) -> Result<Vec<UserMarketPosition>, StoreError>;
    async fn get_user_aggregate_stats(&self, user: &str) -> Result<Option<UserStats>, StoreError>;
    async fn get_user_positions(
        &self,
        user: &str,
        condition_id: &str,
    ) -> Result<Vec<UserMarketPosition>, StoreError>;

    /// Realized PnL is read straight off the stored positions; unrealized
    /// PnL is computed query-time against the condition's current prices, so
    /// this is never itself persisted. Returns `None` when the user holds no
    /// position on the condition.
    async fn calculate_user_pnl(
        &self,
        user: &str,
        condition_id: &str,
    ) -> Result<Option<UserConditionPnl>, StoreError> {
        let positions = self.get_user_positions(user, condition_id).await?;
        if positions.is_empty() {
            return Ok(None);
        }
        let metrics = self.get_market_metrics(condition_id).await?;

        let mut current_shares = Decimal::ZERO;
        let mut realized_pnl = Decimal::ZERO;
        let mut unrealized_pnl = Decimal::ZERO;
        for position in &positions {
            current_shares += position.current_shares;
            realized_pnl += position.realized_pnl;
            if let Some(metrics) = &metrics {
                unrealized_pnl += position.unrealized_pnl(position.current_price(metrics));
            }
        }

        Ok(Some(UserConditionPnl {
            user: user.to_string(),
            condition_id: condition_id.to_string(),
            current_shares,
            realized_pnl,
            unrealized_pnl,
        }))
    }
}
