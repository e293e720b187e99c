//! End-to-end event-application scenarios run against an in-memory
//! `SqliteStore`, driven directly through the `EventApplier` (no RPC).

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use polymarket_indexer::applier::EventApplier;
use polymarket_indexer::chain::{DecodedEvent, EventArgs};
use polymarket_indexer::store::{SqliteStore, Store};
use rust_decimal_macros::dec;

const COLLATERAL: &str = "0x2791bca1f2de4661ed88a30c99a7a9449aa84174";
const CONDITION_ID: &str = "0x000000000000000000000000000000000000000000000000000000000000c0";
const ORACLE: &str = "0x00000000000000000000000000000000000000000000000000000000000000";
const QUESTION_ID: &str = "0x00000000000000000000000000000000000000000000000000000000000011";
const EXCHANGE_ADDR: &str = "0x0000000000000000000000000000000000e4c8";
const TRADER: &str = "0x000000000000000000000000000000000000000000000000000000000000fe";

fn b256(hex: &str) -> B256 {
    B256::from_str(hex).expect("valid 32-byte hex literal")
}

fn address(hex: &str) -> Address {
    Address::from_str(hex).expect("valid 20-byte hex literal")
}

fn condition_preparation(block: u64, tx: &str, slots: u64) -> DecodedEvent {
    DecodedEvent {
        block_number: block,
        block_timestamp: 1_700_000_000 + block as i64,
        tx_hash: b256(tx),
        log_index: 0,
        contract_address: address("0x0000000000000000000000000000000000aaaa"),
        args: EventArgs::ConditionPreparation {
            condition_id: b256(CONDITION_ID),
            oracle: address(ORACLE),
            question_id: b256(QUESTION_ID),
            outcome_slot_count: U256::from(slots),
        },
    }
}

fn condition_resolution(block: u64, tx: &str, payouts: &[u64]) -> DecodedEvent {
    DecodedEvent {
        block_number: block,
        block_timestamp: 1_700_000_000 + block as i64,
        tx_hash: b256(tx),
        log_index: 0,
        contract_address: address("0x0000000000000000000000000000000000aaaa"),
        args: EventArgs::ConditionResolution {
            condition_id: b256(CONDITION_ID),
            oracle: address(ORACLE),
            question_id: b256(QUESTION_ID),
            payout_numerators: payouts.iter().map(|n| U256::from(*n)).collect(),
        },
    }
}

fn order_filled(block: u64, tx: &str, token_id: u64, maker_amount: u64, taker_amount: u64, side: u8) -> DecodedEvent {
    DecodedEvent {
        block_number: block,
        block_timestamp: 1_700_000_000 + block as i64,
        tx_hash: b256(tx),
        log_index: 1,
        contract_address: address(EXCHANGE_ADDR),
        args: EventArgs::OrderFilled {
            maker: address("0x0000000000000000000000000000000000b00b"),
            taker: address(TRADER),
            token_id: U256::from(token_id),
            maker_amount: U256::from(maker_amount),
            taker_amount: U256::from(taker_amount),
            side,
        },
    }
}

fn tx(n: u64) -> String {
    format!("0x{:064x}", n)
}

async fn backfill_outcome_zero_token(store: &Arc<dyn Store>, token_id: &str) {
    store
        .backfill_position_token_id(CONDITION_ID, 0, token_id)
        .await
        .expect("backfill position token");
}

#[tokio::test]
async fn lifecycle_creates_condition_and_position_tokens() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();

    let condition = store.get_condition(CONDITION_ID).await.unwrap().unwrap();
    assert_eq!(condition.outcome_slot_count, 2);
    assert!(!condition.resolved);

    // One PositionToken row per outcome slot is created eagerly at
    // ConditionPreparation time with token_id = NULL, then backfilled lazily
    // as on-chain ids are observed.
    store.backfill_position_token_id(CONDITION_ID, 0, "1000").await.unwrap();
    store.backfill_position_token_id(CONDITION_ID, 1, "1001").await.unwrap();

    let pt0 = store.find_position_token_by_token_id("1000").await.unwrap().unwrap();
    assert_eq!(pt0.outcome_index, 0);
    let pt1 = store.find_position_token_by_token_id("1001").await.unwrap().unwrap();
    assert_eq!(pt1.outcome_index, 1);
}

#[tokio::test]
async fn scenario_buy_then_partial_sell_then_resolution() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    backfill_outcome_zero_token(&store, "777").await;

    // Buy: maker=100, taker=60, side=0 -> price 0.6, is_buy=true.
    applier
        .apply(&order_filled(101, &tx(2), 777, 100, 60, 0))
        .await
        .unwrap();

    let position = store
        .get_user_market_position(TRADER, CONDITION_ID, 0)
        .await
        .unwrap()
        .expect("position created on first buy");
    assert_eq!(position.current_shares, dec!(100));
    assert_eq!(position.total_cost_basis, dec!(60));
    assert_eq!(position.average_buy_price, dec!(0.6));

    let stats = store.get_user_aggregate_stats(TRADER).await.unwrap().unwrap();
    assert_eq!(stats.total_volume, dec!(60));
    assert_eq!(stats.total_trades, 1);

    // Sell: maker=40, taker=32, side=1 -> price 0.8, is_buy=false.
    applier
        .apply(&order_filled(102, &tx(3), 777, 40, 32, 1))
        .await
        .unwrap();

    let position = store
        .get_user_market_position(TRADER, CONDITION_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.current_shares, dec!(60));
    assert_eq!(position.total_proceeds, dec!(32));
    assert_eq!(position.realized_pnl, dec!(32) - dec!(0.6) * dec!(40));
    assert_eq!(position.average_buy_price, dec!(0.6)); // unchanged on sell

    // Resolution arrives after the trades; no balance/position mutation.
    applier
        .apply(&condition_resolution(103, &tx(4), &[1, 0]))
        .await
        .unwrap();

    let condition = store.get_condition(CONDITION_ID).await.unwrap().unwrap();
    assert!(condition.resolved);
    assert_eq!(condition.payout_numerators, Some(vec![1, 0]));

    let position_after_resolution = store
        .get_user_market_position(TRADER, CONDITION_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position_after_resolution.current_shares, dec!(60));
}

#[tokio::test]
async fn calculate_user_pnl_combines_realized_and_unrealized() {
    use polymarket_indexer::derived::metrics;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    backfill_outcome_zero_token(&store, "31").await;

    // No position yet: nothing to report.
    assert!(store.calculate_user_pnl(TRADER, CONDITION_ID).await.unwrap().is_none());

    // Buy 100 shares at 0.5, then sell 40 at 0.6, realizing (0.6-0.5)*40 = 4.
    applier.apply(&order_filled(101, &tx(2), 31, 100, 50, 0)).await.unwrap();
    applier.apply(&order_filled(102, &tx(3), 31, 40, 24, 1)).await.unwrap();

    let fresh_metrics = metrics::recompute(&store, CONDITION_ID).await.unwrap();
    store.upsert_market_metrics(&fresh_metrics).await.unwrap();

    let pnl = store.calculate_user_pnl(TRADER, CONDITION_ID).await.unwrap().unwrap();
    assert_eq!(pnl.current_shares, dec!(60));
    assert_eq!(pnl.realized_pnl, dec!(24) - dec!(0.5) * dec!(40));
    // Outcome 0's current price is yes_price, last traded at 0.6.
    assert_eq!(pnl.unrealized_pnl, dec!(60) * (fresh_metrics.yes_price - dec!(0.5)));
}

#[tokio::test]
async fn idempotent_replay_yields_identical_state() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    let events = vec![
        condition_preparation(100, &tx(1), 2),
        order_filled(101, &tx(2), 555, 100, 60, 0),
    ];

    for e in &events {
        applier.apply(e).await.unwrap();
    }
    backfill_outcome_zero_token(&store, "555").await;

    // Re-derive once more after backfill so the buy picks up the position join,
    // mirroring how a replay would reprocess the same (tx_hash, log_index).
    for e in &events {
        applier.apply(e).await.unwrap();
    }

    let trades = store.get_market_trades(CONDITION_ID, 10).await.unwrap();
    assert_eq!(trades.len(), 1, "idempotent on (tx_hash, log_index)");

    // The trade row is only newly-inserted on the very first apply; the
    // replay's insert_trade_if_new conflicts and short-circuits before
    // touching UserStats again, so total_trades reflects exactly one trade.
    let stats = store.get_user_aggregate_stats(TRADER).await.unwrap().unwrap();
    assert_eq!(stats.total_trades, 1);
}

#[tokio::test]
async fn sell_without_prior_position_is_skipped_not_fatal() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    backfill_outcome_zero_token(&store, "42").await;

    // Sell with no prior buy: should not error, should not create a position.
    applier
        .apply(&order_filled(101, &tx(2), 42, 10, 4, 1))
        .await
        .unwrap();

    let position = store.get_user_market_position(TRADER, CONDITION_ID, 0).await.unwrap();
    assert!(position.is_none());
}

#[tokio::test]
async fn sell_exceeding_holdings_does_not_mutate_position() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    backfill_outcome_zero_token(&store, "9").await;

    applier.apply(&order_filled(101, &tx(2), 9, 10, 4, 0)).await.unwrap(); // buy 10

    // Attempt to sell 11 shares when only 10 are held.
    applier.apply(&order_filled(102, &tx(3), 9, 11, 5, 1)).await.unwrap();

    let position = store
        .get_user_market_position(TRADER, CONDITION_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.current_shares, dec!(10), "oversell must not mutate the position");
}

#[tokio::test]
async fn transfer_single_mint_then_burn_apply_one_sided_deltas() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    store.backfill_position_token_id(CONDITION_ID, 0, "5").await.unwrap();

    let zero = address("0x0000000000000000000000000000000000000000");
    let user_a = address("0x00000000000000000000000000000000000aaaa");

    let mint = DecodedEvent {
        block_number: 101,
        block_timestamp: 1_700_000_101,
        tx_hash: b256(&tx(2)),
        log_index: 0,
        contract_address: address("0x0000000000000000000000000000000000aaaa"),
        args: EventArgs::TransferSingle {
            operator: zero,
            from: zero,
            to: user_a,
            id: U256::from(5u64),
            value: U256::from(100u64),
        },
    };
    applier.apply(&mint).await.unwrap();

    let balance_after_mint = store
        .sum_positive_balances_for_condition(CONDITION_ID)
        .await
        .unwrap();
    assert_eq!(balance_after_mint, dec!(100), "mint applies a single positive delta");

    let burn = DecodedEvent {
        block_number: 102,
        block_timestamp: 1_700_000_102,
        tx_hash: b256(&tx(3)),
        log_index: 0,
        contract_address: address("0x0000000000000000000000000000000000aaaa"),
        args: EventArgs::TransferSingle {
            operator: zero,
            from: user_a,
            to: zero,
            id: U256::from(5u64),
            value: U256::from(40u64),
        },
    };
    applier.apply(&burn).await.unwrap();

    let balance_after_burn = store
        .sum_positive_balances_for_condition(CONDITION_ID)
        .await
        .unwrap();
    assert_eq!(balance_after_burn, dec!(60), "burn subtracts from the holder, no deltas land on the zero address");
}

#[tokio::test]
async fn transfer_single_replay_does_not_double_apply_balance() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    store.backfill_position_token_id(CONDITION_ID, 0, "5").await.unwrap();

    let zero = address("0x0000000000000000000000000000000000000000");
    let user_a = address("0x00000000000000000000000000000000000aaaa");

    let mint = DecodedEvent {
        block_number: 101,
        block_timestamp: 1_700_000_101,
        tx_hash: b256(&tx(2)),
        log_index: 0,
        contract_address: address("0x0000000000000000000000000000000000aaaa"),
        args: EventArgs::TransferSingle {
            operator: zero,
            from: zero,
            to: user_a,
            id: U256::from(5u64),
            value: U256::from(100u64),
        },
    };

    // Apply the same (tx_hash, log_index) twice, as a crash-before-checkpoint
    // replay would.
    applier.apply(&mint).await.unwrap();
    applier.apply(&mint).await.unwrap();

    let balance = store.sum_positive_balances_for_condition(CONDITION_ID).await.unwrap();
    assert_eq!(balance, dec!(100), "replayed TransferSingle must not double the balance delta");
}

#[tokio::test]
async fn enrichment_never_overwrites_non_null_fields() {
    use polymarket_indexer::models::CatalogDescriptor;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());
    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();

    let first = CatalogDescriptor {
        condition_id: CONDITION_ID.to_string(),
        question: Some("Q?".to_string()),
        description: None,
        category: None,
        end_date_iso: None,
        image: None,
        clob_token_ids: None,
    };
    let updated = store.upsert_condition_metadata_coalesce(&first, None).await.unwrap();
    assert!(updated);

    let condition = store.get_condition(CONDITION_ID).await.unwrap().unwrap();
    assert_eq!(condition.question, Some("Q?".to_string()));

    let second = CatalogDescriptor {
        condition_id: CONDITION_ID.to_string(),
        question: None,
        description: None,
        category: Some("Politics".to_string()),
        end_date_iso: None,
        image: None,
        clob_token_ids: None,
    };
    store.upsert_condition_metadata_coalesce(&second, None).await.unwrap();

    let condition = store.get_condition(CONDITION_ID).await.unwrap().unwrap();
    assert_eq!(condition.question, Some("Q?".to_string()), "question survives a null overwrite");
    assert_eq!(condition.category, Some("Politics".to_string()));
}

#[tokio::test]
async fn enrichment_backfills_position_tokens_from_catalog_token_ids() {
    use polymarket_indexer::models::CatalogDescriptor;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());
    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();

    // Position tokens start unbackfilled: no row resolves by token id yet.
    assert!(store.find_position_token_by_token_id("yes-111").await.unwrap().is_none());

    let descriptor = CatalogDescriptor {
        condition_id: CONDITION_ID.to_string(),
        question: Some("Will it happen?".to_string()),
        description: None,
        category: None,
        end_date_iso: None,
        image: None,
        clob_token_ids: Some(vec!["yes-111".to_string(), "no-222".to_string()]),
    };
    let updated = store.upsert_condition_metadata_coalesce(&descriptor, None).await.unwrap();
    assert!(updated);

    for (outcome_index, token_id) in descriptor.clob_token_ids.as_ref().unwrap().iter().enumerate() {
        store
            .backfill_position_token_id(CONDITION_ID, outcome_index as u32, token_id)
            .await
            .unwrap();
    }

    let yes_token = store.find_position_token_by_token_id("yes-111").await.unwrap().unwrap();
    assert_eq!(yes_token.outcome_index, 0);
    let no_token = store.find_position_token_by_token_id("no-222").await.unwrap().unwrap();
    assert_eq!(no_token.outcome_index, 1);

    // A later catalog pass with a different id for the same outcome must not
    // clobber the id already observed on chain.
    store
        .backfill_position_token_id(CONDITION_ID, 0, "stale-replacement-id")
        .await
        .unwrap();
    let yes_token = store.find_position_token_by_token_id("yes-111").await.unwrap();
    assert!(yes_token.is_some(), "previously backfilled id is not overwritten");
}

#[tokio::test]
async fn checkpoint_state_tracks_indexer_progress() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());

    assert!(store.get_indexer_state("conditional_tokens").await.unwrap().is_none());

    store.update_indexer_state("conditional_tokens", 500, 3).await.unwrap();
    let state = store.get_indexer_state("conditional_tokens").await.unwrap().unwrap();
    assert_eq!(state.last_processed_block, 500);
    assert_eq!(state.total_events_processed, 3);

    // Checkpoint monotonicity: a smaller proposed value never moves it backward.
    store.update_indexer_state("conditional_tokens", 400, 1).await.unwrap();
    let state = store.get_indexer_state("conditional_tokens").await.unwrap().unwrap();
    assert_eq!(state.last_processed_block, 500);

    store.mark_indexer_error("conditional_tokens", "rpc timeout").await.unwrap();
    let state = store.get_indexer_state("conditional_tokens").await.unwrap().unwrap();
    assert_eq!(state.error_message.as_deref(), Some("rpc timeout"));
}

#[tokio::test]
async fn market_metrics_recompute_over_a_trade_window() {
    use polymarket_indexer::derived::metrics;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    store.backfill_position_token_id(CONDITION_ID, 0, "88").await.unwrap();

    // Ten trades spaced 2h40m apart, spanning ~24h, prices rising 0.50 -> 0.68.
    let now = chrono::Utc::now().timestamp();
    let span_secs = 24 * 3_600;
    for i in 0..10u64 {
        let price_maker = 100u64;
        let price_taker = 50 + 2 * i; // 50, 52, .., 68 -> price 0.50..0.68
        let block_ts = now - span_secs + (i * span_secs / 9);

        let event = DecodedEvent {
            block_number: 200 + i,
            block_timestamp: block_ts,
            tx_hash: b256(&tx(10 + i)),
            log_index: 1,
            contract_address: address(EXCHANGE_ADDR),
            args: EventArgs::OrderFilled {
                maker: address("0x0000000000000000000000000000000000b00b"),
                taker: address(TRADER),
                token_id: U256::from(88u64),
                maker_amount: U256::from(price_maker),
                taker_amount: U256::from(price_taker),
                side: 0,
            },
        };
        applier.apply(&event).await.unwrap();
    }

    let fresh = metrics::recompute(&store, CONDITION_ID).await.unwrap();

    assert_eq!(fresh.yes_price, dec!(0.68));
    assert_eq!(fresh.yes_price + fresh.no_price, dec!(1), "yes and no prices always sum to one");
    assert!((fresh.price_24h_change_pct - 36.0).abs() < 5.0);
    assert!((fresh.price_momentum - 0.36).abs() < 0.05);
    assert!(fresh.adjusted_volatility > 0.0);
}

#[tokio::test]
async fn single_trade_window_has_zero_momentum_and_volatility() {
    use polymarket_indexer::derived::metrics;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let applier = EventApplier::new(store.clone(), COLLATERAL.to_string());

    applier.apply(&condition_preparation(100, &tx(1), 2)).await.unwrap();
    store.backfill_position_token_id(CONDITION_ID, 0, "1").await.unwrap();
    applier.apply(&order_filled(101, &tx(2), 1, 100, 55, 0)).await.unwrap();

    // A single-trade window has nothing to compare against, so volatility and
    // volume momentum both come out to zero rather than NaN or a divide panic.
    let fresh = metrics::recompute(&store, CONDITION_ID).await.unwrap();
    assert_eq!(fresh.adjusted_volatility, 0.0);
    assert_eq!(fresh.volume_momentum, 0.0);
}
