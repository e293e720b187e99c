//! Pure position/PnL math. Kept free of I/O so the
//! buy/sell formulas can be unit tested directly against fixed decimals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::models::UserMarketPosition;

/// Applies a fill of `shares` at `amount` collateral to `position`, in place.
///
/// Returns `false` (B4) when a sell would exceed the shares currently held;
/// the position is left untouched in that case and the caller should not
/// persist it.
pub fn apply_fill(
    position: &mut UserMarketPosition,
    is_buy: bool,
    shares: Decimal,
    amount: Decimal,
    traded_at: DateTime<Utc>,
) -> bool {
    if is_buy {
        position.total_shares_bought += shares;
        position.current_shares += shares;
        position.total_cost_basis += amount;
        position.average_buy_price = if position.total_shares_bought.is_zero() {
            Decimal::ZERO
        } else {
            position.total_cost_basis / position.total_shares_bought
        };
    } else {
        if shares > position.current_shares {
            warn!(
                user = %position.user,
                condition_id = %position.condition_id,
                outcome_index = position.outcome_index,
                shares = %shares,
                held = %position.current_shares,
                "sell exceeds current holdings, skipping mutation"
            );
            return false;
        }

        position.total_shares_sold += shares;
        position.current_shares -= shares;
        position.total_proceeds += amount;
        position.realized_pnl += amount - position.average_buy_price * shares;
    }

    position.last_trade_at = position.last_trade_at.max(traded_at);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_position() -> UserMarketPosition {
        UserMarketPosition::new(
            "0xtrader".to_string(),
            "0xcond".to_string(),
            0,
            Utc::now(),
        )
    }

    #[test]
    fn buy_updates_average_price() {
        let mut position = new_position();
        assert!(apply_fill(&mut position, true, dec!(10), dec!(4), Utc::now()));
        assert_eq!(position.current_shares, dec!(10));
        assert_eq!(position.average_buy_price, dec!(0.4));

        assert!(apply_fill(&mut position, true, dec!(10), dec!(8), Utc::now()));
        assert_eq!(position.current_shares, dec!(20));
        assert_eq!(position.total_cost_basis, dec!(12));
        assert_eq!(position.average_buy_price, dec!(0.6));
    }

    #[test]
    fn sell_keeps_average_price_but_realizes_pnl() {
        let mut position = new_position();
        apply_fill(&mut position, true, dec!(10), dec!(4), Utc::now());

        assert!(apply_fill(&mut position, false, dec!(5), dec!(3), Utc::now()));
        assert_eq!(position.current_shares, dec!(5));
        assert_eq!(position.average_buy_price, dec!(0.4));
        assert_eq!(position.realized_pnl, dec!(3) - dec!(0.4) * dec!(5));
    }

    #[test]
    fn sell_exceeding_holdings_is_skipped() {
        let mut position = new_position();
        apply_fill(&mut position, true, dec!(10), dec!(4), Utc::now());

        let applied = apply_fill(&mut position, false, dec!(11), dec!(5), Utc::now());
        assert!(!applied);
        assert_eq!(position.current_shares, dec!(10));
    }

    #[test]
    fn unrealized_pnl_uses_current_price() {
        let mut position = new_position();
        apply_fill(&mut position, true, dec!(10), dec!(4), Utc::now());
        assert_eq!(position.unrealized_pnl(dec!(0.6)), dec!(10) * (dec!(0.6) - dec!(0.4)));
    }
}
