//! Market-metrics recompute. Reads recent trades and
//! balances through the `Store` trait and writes back a fresh
//! `MarketMetrics` row; the statistics themselves (momentum, volatility) run
//! in `f64` once the Decimal inputs are collected.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::models::{MarketMetrics, Trade};
use crate::store::Store;

const RECENT_TRADES_WINDOW: usize = 100;
const SECS_1H: i64 = 3_600;
const SECS_4H: i64 = 4 * 3_600;
const SECS_12H: i64 = 12 * 3_600;
const SECS_24H: i64 = 24 * 3_600;

pub async fn recompute(store: &Arc<dyn Store>, condition_id: &str) -> Result<MarketMetrics, StoreError> {
    let now = Utc::now();
    let now_ts = now.timestamp();

    let volume_1h = store.windowed_volume(condition_id, now_ts - SECS_1H).await?;
    let volume_4h = store.windowed_volume(condition_id, now_ts - SECS_4H).await?;
    let volume_12h = store.windowed_volume(condition_id, now_ts - SECS_12H).await?;
    let volume_24h = store.windowed_volume(condition_id, now_ts - SECS_24H).await?;
    let trade_count_24h = store.trade_count_since(condition_id, now_ts - SECS_24H).await?;
    let unique_traders_24h = store.unique_traders_since(condition_id, now_ts - SECS_24H).await?;

    // Outcome 0 is the "yes" leg by the PositionToken derivation convention
    // (derive_position_id uses ascending outcome_index, and binary markets
    // enumerate yes=0, no=1 at ConditionPreparation time).
    let recent = store
        .recent_trades_on_outcome(condition_id, 0, RECENT_TRADES_WINDOW)
        .await?;

    let yes_price = recent.first().map(|t| t.price).unwrap_or(Decimal::ZERO);
    let no_price = Decimal::ONE - yes_price;

    let yes_price_12h_ago = oldest_within(&recent, now_ts - SECS_12H).unwrap_or(yes_price);
    let yes_price_24h_ago = oldest_within(&recent, now_ts - SECS_24H).unwrap_or(yes_price);

    let price_12h_change_pct = pct_change(yes_price, yes_price_12h_ago);
    let price_24h_change_pct = pct_change(yes_price, yes_price_24h_ago);

    let price_momentum = price_momentum(&recent);
    let volume_momentum = volume_momentum(&recent);

    let open_interest = store.sum_positive_balances_for_condition(condition_id).await?;
    let total_liquidity = open_interest * yes_price;

    let turnover_ratio = if total_liquidity > Decimal::ZERO {
        (volume_24h / total_liquidity).to_f64().unwrap_or(0.0)
    } else {
        0.0
    };

    let adjusted_volatility = population_stdev(&recent);

    Ok(MarketMetrics {
        condition_id: condition_id.to_string(),
        volume_1h,
        volume_4h,
        volume_12h,
        volume_24h,
        yes_price,
        no_price,
        yes_price_12h_ago,
        yes_price_24h_ago,
        price_12h_change_pct,
        price_24h_change_pct,
        total_liquidity,
        open_interest,
        trade_count_24h,
        unique_traders_24h,
        price_momentum,
        volume_momentum,
        turnover_ratio,
        adjusted_volatility,
        computed_at: now,
    })
}

fn oldest_within(recent_newest_first: &[Trade], cutoff_ts: i64) -> Option<Decimal> {
    recent_newest_first
        .iter()
        .filter(|t| t.block_timestamp >= cutoff_ts)
        .last()
        .map(|t| t.price)
}

fn pct_change(now: Decimal, then: Decimal) -> f64 {
    if then.is_zero() {
        return 0.0;
    }
    ((now - then) / then * Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(0.0)
}

/// `recent` is ordered newest-first; the oldest entry in the slice is the
/// window's starting price.
fn price_momentum(recent: &[Trade]) -> f64 {
    let Some(first_in_window) = recent.last() else {
        return 0.0;
    };
    let Some(last) = recent.first() else {
        return 0.0;
    };
    if first_in_window.price.is_zero() {
        return 0.0;
    }
    ((last.price - first_in_window.price) / first_in_window.price)
        .to_f64()
        .unwrap_or(0.0)
}

fn volume_momentum(recent: &[Trade]) -> f64 {
    if recent.len() < 2 {
        return 0.0;
    }
    let mid = recent.len() / 2;
    let (newer_half, older_half) = recent.split_at(mid);

    let v_recent: Decimal = newer_half.iter().map(|t| t.collateral_amount).sum();
    let v_older: Decimal = older_half.iter().map(|t| t.collateral_amount).sum();

    if v_older.is_zero() {
        return 0.0;
    }
    ((v_recent - v_older) / v_older).to_f64().unwrap_or(0.0)
}

fn population_stdev(recent: &[Trade]) -> f64 {
    if recent.len() < 2 {
        return 0.0;
    }
    let prices: Vec<f64> = recent.iter().filter_map(|t| t.price.to_f64()).collect();
    if prices.len() < 2 {
        return 0.0;
    }
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / prices.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: Decimal, collateral_amount: Decimal, block_timestamp: i64) -> Trade {
        Trade {
            tx_hash: "0x0".to_string(),
            log_index: 0,
            block_number: 0,
            block_timestamp,
            exchange_address: "0x0".to_string(),
            trader: "0x0".to_string(),
            token_id: "1".to_string(),
            collateral_token: "0x0".to_string(),
            token_amount: Decimal::ONE,
            collateral_amount,
            price,
            is_buy: true,
            order_id: None,
        }
    }

    #[test]
    fn momentum_uses_window_endpoints() {
        let recent = vec![
            trade(Decimal::new(6, 1), Decimal::TEN, 300),
            trade(Decimal::new(5, 1), Decimal::TEN, 200),
            trade(Decimal::new(4, 1), Decimal::TEN, 100),
        ];
        let momentum = price_momentum(&recent);
        assert!((momentum - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stdev_of_identical_prices_is_zero() {
        let recent = vec![
            trade(Decimal::new(5, 1), Decimal::TEN, 300),
            trade(Decimal::new(5, 1), Decimal::TEN, 200),
        ];
        assert_eq!(population_stdev(&recent), 0.0);
    }

    #[test]
    fn empty_window_does_not_panic() {
        assert_eq!(price_momentum(&[]), 0.0);
        assert_eq!(volume_momentum(&[]), 0.0);
        assert_eq!(population_stdev(&[]), 0.0);
    }
}
