//! Event Applier: converts one decoded on-chain event into Store mutations.
//! Each handler is responsible for its own atomicity;
//! the Store methods it calls already wrap their writes in transactions
//! where more than one statement must land together.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::chain::{DecodedEvent, EventArgs};
use crate::derived::position::apply_fill;
use crate::error::ApplyError;
use crate::models::{Condition, EventLogRow, PriceHistoryTick, Trade, UserMarketPosition};
use crate::store::Store;

pub struct EventApplier {
    store: Arc<dyn Store>,
    collateral_token_address: String,
}

impl EventApplier {
    pub fn new(store: Arc<dyn Store>, collateral_token_address: String) -> Self {
        Self {
            store,
            collateral_token_address,
        }
    }

    pub async fn apply(&self, event: &DecodedEvent) -> Result<(), ApplyError> {
        let result = match &event.args {
            EventArgs::ConditionPreparation {
                condition_id,
                oracle,
                question_id,
                outcome_slot_count,
            } => {
                self.apply_condition_preparation(
                    event,
                    condition_id.to_string(),
                    oracle.to_string(),
                    question_id.to_string(),
                    outcome_slot_count.to::<u32>(),
                )
                .await
            }
            EventArgs::ConditionResolution {
                condition_id,
                payout_numerators,
                ..
            } => {
                self.apply_condition_resolution(
                    event,
                    condition_id.to_string(),
                    payout_numerators.iter().map(|n| n.to::<u64>()).collect(),
                )
                .await
            }
            EventArgs::TransferSingle {
                from, to, id, value, ..
            } => self.apply_transfer_single(event, *from, *to, *id, *value).await,
            EventArgs::OrderFilled {
                maker,
                taker,
                token_id,
                maker_amount,
                taker_amount,
                side,
            } => {
                self.apply_order_filled(
                    event,
                    *maker,
                    *taker,
                    token_id.to_string(),
                    *maker_amount,
                    *taker_amount,
                    *side,
                )
                .await
            }
        };

        self.archive(event, result.is_ok()).await;
        result
    }

    async fn archive(&self, event: &DecodedEvent, processed: bool) {
        let row = EventLogRow {
            block_number: event.block_number,
            tx_hash: event.tx_hash.to_string(),
            log_index: event.log_index,
            contract_address: event.contract_address.to_string(),
            event_name: event.args.event_name().to_string(),
            event_args_json: format!("{:?}", event.args),
            processed,
        };
        if let Err(e) = self.store.append_event_log(&row).await {
            warn!(error = %e, "failed to archive event log row");
        }
    }

    async fn apply_condition_preparation(
        &self,
        event: &DecodedEvent,
        condition_id: String,
        oracle: String,
        question_id: String,
        outcome_slot_count: u32,
    ) -> Result<(), ApplyError> {
        let condition = Condition {
            condition_id,
            oracle,
            question_id,
            outcome_slot_count,
            created_at_block: event.block_number,
            created_at_tx: event.tx_hash.to_string(),
            created_at: block_time(event.block_timestamp),
            ..Default::default()
        };
        self.store.upsert_condition_on_preparation(&condition).await?;
        Ok(())
    }

    async fn apply_condition_resolution(
        &self,
        _event: &DecodedEvent,
        condition_id: String,
        payout_numerators: Vec<u64>,
    ) -> Result<(), ApplyError> {
        self.store
            .mark_condition_resolved(&condition_id, &payout_numerators)
            .await?;
        Ok(())
    }

    async fn apply_transfer_single(
        &self,
        event: &DecodedEvent,
        from: Address,
        to: Address,
        id: U256,
        value: U256,
    ) -> Result<(), ApplyError> {
        let tx_hash = event.tx_hash.to_string();
        let inserted = self.store.insert_transfer_if_new(&tx_hash, event.log_index).await?;
        if !inserted {
            // Replay of an already-applied log; skip re-applying the balance delta.
            return Ok(());
        }

        let token_id = id.to_string();
        let amount = u256_to_decimal(value)?;
        let timestamp = block_time(event.block_timestamp);

        if !from.is_zero() {
            self.store
                .apply_balance_delta(&from.to_string(), &token_id, -amount, event.block_number, &tx_hash, timestamp)
                .await?;
        }
        if !to.is_zero() {
            self.store
                .apply_balance_delta(&to.to_string(), &token_id, amount, event.block_number, &tx_hash, timestamp)
                .await?;
        }
        Ok(())
    }

    async fn apply_order_filled(
        &self,
        event: &DecodedEvent,
        _maker: Address,
        taker: Address,
        token_id: String,
        maker_amount: U256,
        taker_amount: U256,
        side: u8,
    ) -> Result<(), ApplyError> {
        let token_amount = u256_to_decimal(maker_amount)?;
        let collateral_amount = u256_to_decimal(taker_amount)?;
        let price = if token_amount.is_zero() {
            Decimal::new(5, 1)
        } else {
            (collateral_amount / token_amount).clamp(Decimal::ZERO, Decimal::ONE)
        };
        let is_buy = side == 0;
        let trader = taker.to_string();
        let timestamp = block_time(event.block_timestamp);

        let trade = Trade {
            tx_hash: event.tx_hash.to_string(),
            log_index: event.log_index,
            block_number: event.block_number,
            block_timestamp: event.block_timestamp,
            exchange_address: event.contract_address.to_string(),
            trader: trader.clone(),
            token_id: token_id.clone(),
            collateral_token: self.collateral_token_address.clone(),
            token_amount,
            collateral_amount,
            price,
            is_buy,
            order_id: None,
        };

        let inserted = self.store.insert_trade_if_new(&trade).await?;
        if !inserted {
            // Replay of an already-applied log; skip derived-state re-application.
            return Ok(());
        }

        self.store
            .upsert_user_stats_on_trade(&trader, collateral_amount, timestamp)
            .await?;

        let Some(position_token) = self.store.find_position_token_by_token_id(&token_id).await? else {
            warn!(token_id, "trade references an unknown token id, position update skipped");
            return Ok(());
        };

        let existing = self
            .store
            .get_user_market_position(&trader, &position_token.condition_id, position_token.outcome_index)
            .await?;

        if !is_buy && existing.is_none() {
            warn!(
                user = trader,
                condition_id = position_token.condition_id,
                "sell arrived without a prior position, skipping"
            );
        } else {
            let mut position = existing.unwrap_or_else(|| {
                UserMarketPosition::new(
                    trader.clone(),
                    position_token.condition_id.clone(),
                    position_token.outcome_index,
                    timestamp,
                )
            });
            if apply_fill(&mut position, is_buy, token_amount, collateral_amount, timestamp) {
                self.store.upsert_user_market_position(&position).await?;
            }
        }

        let tick = PriceHistoryTick {
            id: None,
            condition_id: position_token.condition_id,
            outcome_index: position_token.outcome_index,
            block_number: event.block_number,
            timestamp: event.block_timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: collateral_amount,
            trade_count: 1,
        };
        self.store.insert_price_history_tick(&tick).await?;

        info!(
            trader, token_id, price = %price, is_buy,
            "applied trade"
        );
        Ok(())
    }
}

fn block_time(unix_seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(unix_seconds, 0).single().unwrap_or_else(Utc::now)
}

fn u256_to_decimal(value: U256) -> Result<Decimal, ApplyError> {
    Decimal::from_str(&value.to_string())
        .map_err(|e| ApplyError::RecoverableInvariant(format!("amount overflows Decimal: {e}")))
}
