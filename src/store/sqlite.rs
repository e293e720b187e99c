//! SQLite-backed `Store` implementation.
//!
//! Grounded on the embedded-store pattern already used for the ambient
//! signal pipeline: WAL mode, a single guarded connection, `prepare_cached`
//! for hot statements, and `INSERT ... ON CONFLICT DO UPDATE` with
//! `COALESCE` for non-destructive merges.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::{
    Block, CatalogDescriptor, Condition, EventLogRow, IndexerState, IndexerStatus, MarketMetrics,
    PositionToken, PriceHistoryTick, Trade, UserMarketPosition, UserStats,
};
use crate::store::Store;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS blocks (
    number INTEGER PRIMARY KEY,
    hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    gas_used INTEGER NOT NULL,
    gas_limit INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS indexer_state (
    name TEXT PRIMARY KEY,
    last_processed_block INTEGER NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    total_events_processed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS conditions (
    condition_id TEXT PRIMARY KEY,
    oracle TEXT NOT NULL,
    question_id TEXT NOT NULL,
    outcome_slot_count INTEGER NOT NULL,
    created_at_block INTEGER NOT NULL,
    created_at_tx TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at_block INTEGER,
    resolved_at_tx TEXT,
    resolved_at TEXT,
    payout_numerators TEXT,
    question TEXT,
    description TEXT,
    end_date TEXT,
    category TEXT,
    image_url TEXT,
    resolution_source TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS position_tokens (
    position_id TEXT PRIMARY KEY,
    condition_id TEXT NOT NULL,
    outcome_index INTEGER NOT NULL,
    token_id TEXT,
    UNIQUE(condition_id, outcome_index)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_position_tokens_token_id ON position_tokens(token_id);

CREATE TABLE IF NOT EXISTS trades (
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    block_timestamp INTEGER NOT NULL,
    exchange_address TEXT NOT NULL,
    trader TEXT NOT NULL,
    token_id TEXT NOT NULL,
    collateral_token TEXT NOT NULL,
    token_amount TEXT NOT NULL,
    collateral_amount TEXT NOT NULL,
    price TEXT NOT NULL,
    is_buy INTEGER NOT NULL,
    order_id TEXT,
    condition_id TEXT,
    outcome_index INTEGER,
    PRIMARY KEY (tx_hash, log_index)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_condition_outcome
    ON trades(condition_id, outcome_index, block_timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_trades_trader ON trades(trader);

CREATE TABLE IF NOT EXISTS applied_transfers (
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    PRIMARY KEY (tx_hash, log_index)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS balances (
    user TEXT NOT NULL,
    token_id TEXT NOT NULL,
    balance TEXT NOT NULL,
    last_updated_block INTEGER NOT NULL,
    last_updated_tx TEXT NOT NULL,
    last_updated_at TEXT NOT NULL,
    PRIMARY KEY (user, token_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS user_market_positions (
    user TEXT NOT NULL,
    condition_id TEXT NOT NULL,
    outcome_index INTEGER NOT NULL,
    total_shares_bought TEXT NOT NULL,
    total_shares_sold TEXT NOT NULL,
    current_shares TEXT NOT NULL,
    total_cost_basis TEXT NOT NULL,
    total_proceeds TEXT NOT NULL,
    average_buy_price TEXT NOT NULL,
    realized_pnl TEXT NOT NULL,
    first_trade_at TEXT NOT NULL,
    last_trade_at TEXT NOT NULL,
    PRIMARY KEY (user, condition_id, outcome_index)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS user_stats (
    user TEXT PRIMARY KEY,
    total_volume TEXT NOT NULL,
    total_trades INTEGER NOT NULL,
    first_trade_at TEXT NOT NULL,
    last_trade_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    condition_id TEXT NOT NULL,
    outcome_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    trade_count INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_history_condition_ts
    ON price_history(condition_id, outcome_index, timestamp DESC);

CREATE TABLE IF NOT EXISTS market_metrics (
    condition_id TEXT PRIMARY KEY,
    volume_1h TEXT NOT NULL,
    volume_4h TEXT NOT NULL,
    volume_12h TEXT NOT NULL,
    volume_24h TEXT NOT NULL,
    yes_price TEXT NOT NULL,
    no_price TEXT NOT NULL,
    yes_price_12h_ago TEXT NOT NULL,
    yes_price_24h_ago TEXT NOT NULL,
    price_12h_change_pct REAL NOT NULL,
    price_24h_change_pct REAL NOT NULL,
    total_liquidity TEXT NOT NULL,
    open_interest TEXT NOT NULL,
    trade_count_24h INTEGER NOT NULL,
    unique_traders_24h INTEGER NOT NULL,
    price_momentum REAL NOT NULL,
    volume_momentum REAL NOT NULL,
    turnover_ratio REAL NOT NULL,
    adjusted_volatility REAL NOT NULL,
    computed_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS event_log (
    block_number INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    contract_address TEXT NOT NULL,
    event_name TEXT NOT NULL,
    event_args_json TEXT NOT NULL,
    processed INTEGER NOT NULL,
    PRIMARY KEY (tx_hash, log_index)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_event_log_block ON event_log(block_number);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        let path = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(database_url);

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(path, "store schema ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn dec(value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value)
        .map_err(|e| StoreError::Invariant(format!("malformed decimal {value:?}: {e}")))
}

fn ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Invariant(format!("malformed timestamp {value:?}: {e}")))
}

fn payout_numerators_to_json(values: &[u64]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn payout_numerators_from_json(value: &str) -> Vec<u64> {
    serde_json::from_str(value).unwrap_or_default()
}

fn row_to_condition(row: &rusqlite::Row) -> rusqlite::Result<Condition> {
    let created_at: String = row.get("created_at")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;
    let end_date: Option<String> = row.get("end_date")?;
    let payout_numerators: Option<String> = row.get("payout_numerators")?;

    Ok(Condition {
        condition_id: row.get("condition_id")?,
        oracle: row.get("oracle")?,
        question_id: row.get("question_id")?,
        outcome_slot_count: row.get("outcome_slot_count")?,
        created_at_block: row.get("created_at_block")?,
        created_at_tx: row.get("created_at_tx")?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
        resolved: row.get::<_, i64>("resolved")? != 0,
        resolved_at_block: row.get("resolved_at_block")?,
        resolved_at_tx: row.get("resolved_at_tx")?,
        resolved_at: resolved_at.and_then(|s| s.parse().ok()),
        payout_numerators: payout_numerators.map(|s| payout_numerators_from_json(&s)),
        question: row.get("question")?,
        description: row.get("description")?,
        end_date: end_date.and_then(|s| s.parse().ok()),
        category: row.get("category")?,
        image_url: row.get("image_url")?,
        resolution_source: row.get("resolution_source")?,
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    Ok(Trade {
        tx_hash: row.get("tx_hash")?,
        log_index: row.get::<_, i64>("log_index")? as u64,
        block_number: row.get::<_, i64>("block_number")? as u64,
        block_timestamp: row.get("block_timestamp")?,
        exchange_address: row.get("exchange_address")?,
        trader: row.get("trader")?,
        token_id: row.get("token_id")?,
        collateral_token: row.get("collateral_token")?,
        token_amount: dec(&row.get::<_, String>("token_amount")?)
            .unwrap_or(Decimal::ZERO),
        collateral_amount: dec(&row.get::<_, String>("collateral_amount")?)
            .unwrap_or(Decimal::ZERO),
        price: dec(&row.get::<_, String>("price")?).unwrap_or(Decimal::ZERO),
        is_buy: row.get::<_, i64>("is_buy")? != 0,
        order_id: row.get("order_id")?,
    })
}

fn row_to_user_market_position(row: &rusqlite::Row) -> rusqlite::Result<UserMarketPosition> {
    Ok(UserMarketPosition {
        user: row.get("user")?,
        condition_id: row.get("condition_id")?,
        outcome_index: row.get::<_, i64>("outcome_index")? as u32,
        total_shares_bought: dec(&row.get::<_, String>("total_shares_bought")?)
            .unwrap_or(Decimal::ZERO),
        total_shares_sold: dec(&row.get::<_, String>("total_shares_sold")?)
            .unwrap_or(Decimal::ZERO),
        current_shares: dec(&row.get::<_, String>("current_shares")?).unwrap_or(Decimal::ZERO),
        total_cost_basis: dec(&row.get::<_, String>("total_cost_basis")?)
            .unwrap_or(Decimal::ZERO),
        total_proceeds: dec(&row.get::<_, String>("total_proceeds")?).unwrap_or(Decimal::ZERO),
        average_buy_price: dec(&row.get::<_, String>("average_buy_price")?)
            .unwrap_or(Decimal::ZERO),
        realized_pnl: dec(&row.get::<_, String>("realized_pnl")?).unwrap_or(Decimal::ZERO),
        first_trade_at: row
            .get::<_, String>("first_trade_at")?
            .parse()
            .unwrap_or_else(|_| Utc::now()),
        last_trade_at: row
            .get::<_, String>("last_trade_at")?
            .parse()
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_block(&self, block: &Block) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO blocks (number, hash, parent_hash, timestamp, gas_used, gas_limit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(number) DO NOTHING",
            params![
                block.number as i64,
                block.hash,
                block.parent_hash,
                block.timestamp,
                block.gas_used as i64,
                block.gas_limit as i64,
            ],
        )?;
        Ok(())
    }

    async fn get_indexer_state(&self, name: &str) -> Result<Option<IndexerState>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT name, last_processed_block, status, error_message, total_events_processed, updated_at
             FROM indexer_state WHERE name = ?1",
        )?;
        let mut rows = stmt.query([name])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(IndexerState {
            name: row.get(0)?,
            last_processed_block: row.get::<_, i64>(1)? as u64,
            status: IndexerStatus::from_str(&row.get::<_, String>(2)?),
            error_message: row.get(3)?,
            total_events_processed: row.get::<_, i64>(4)? as u64,
            updated_at: row
                .get::<_, String>(5)?
                .parse()
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn update_indexer_state(
        &self,
        name: &str,
        last_processed_block: u64,
        events_processed_delta: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO indexer_state (name, last_processed_block, status, error_message, total_events_processed, updated_at)
             VALUES (?1, ?2, 'RUNNING', NULL, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                last_processed_block = MAX(indexer_state.last_processed_block, excluded.last_processed_block),
                status = 'RUNNING',
                error_message = NULL,
                total_events_processed = indexer_state.total_events_processed + ?3,
                updated_at = excluded.updated_at",
            params![name, last_processed_block as i64, events_processed_delta as i64, now],
        )?;
        Ok(())
    }

    async fn mark_indexer_error(&self, name: &str, message: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO indexer_state (name, last_processed_block, status, error_message, total_events_processed, updated_at)
             VALUES (?1, 0, 'ERROR', ?2, 0, ?3)
             ON CONFLICT(name) DO UPDATE SET
                status = 'ERROR',
                error_message = excluded.error_message,
                updated_at = excluded.updated_at",
            params![name, message, now],
        )?;
        warn!(indexer = name, error = message, "sub-indexer marked ERROR");
        Ok(())
    }

    async fn mark_indexer_idle(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE indexer_state SET status = 'IDLE', updated_at = ?2 WHERE name = ?1",
            params![name, now],
        )?;
        Ok(())
    }

    async fn upsert_condition_on_preparation(&self, condition: &Condition) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> rusqlite::Result<()> {
            conn.execute(
                "INSERT INTO conditions
                    (condition_id, oracle, question_id, outcome_slot_count,
                     created_at_block, created_at_tx, created_at, resolved)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
                 ON CONFLICT(condition_id) DO NOTHING",
                params![
                    condition.condition_id,
                    condition.oracle,
                    condition.question_id,
                    condition.outcome_slot_count,
                    condition.created_at_block as i64,
                    condition.created_at_tx,
                    condition.created_at.to_rfc3339(),
                ],
            )?;

            for outcome_index in 0..condition.outcome_slot_count {
                let position_id =
                    PositionToken::derive_position_id(&condition.condition_id, outcome_index);
                conn.execute(
                    "INSERT INTO position_tokens (position_id, condition_id, outcome_index, token_id)
                     VALUES (?1, ?2, ?3, NULL)
                     ON CONFLICT(position_id) DO NOTHING",
                    params![position_id, condition.condition_id, outcome_index],
                )?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(StoreError::from(e))
            }
        }
    }

    async fn mark_condition_resolved(
        &self,
        condition_id: &str,
        payout_numerators: &[u64],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE conditions SET
                resolved = 1,
                payout_numerators = ?2,
                resolved_at = COALESCE(resolved_at, ?3)
             WHERE condition_id = ?1",
            params![
                condition_id,
                payout_numerators_to_json(payout_numerators),
                now
            ],
        )?;
        Ok(())
    }

    async fn get_condition(&self, condition_id: &str) -> Result<Option<Condition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM conditions WHERE condition_id = ?1")?;
        let mut rows = stmt.query([condition_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_condition(row)?)),
            None => Ok(None),
        }
    }

    async fn find_position_token_by_token_id(
        &self,
        token_id: &str,
    ) -> Result<Option<PositionToken>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT position_id, condition_id, outcome_index, token_id
             FROM position_tokens WHERE token_id = ?1",
        )?;
        let mut rows = stmt.query([token_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(PositionToken {
            position_id: row.get(0)?,
            condition_id: row.get(1)?,
            outcome_index: row.get::<_, i64>(2)? as u32,
            token_id: row.get(3)?,
        }))
    }

    async fn backfill_position_token_id(
        &self,
        condition_id: &str,
        outcome_index: u32,
        token_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE position_tokens SET token_id = COALESCE(token_id, ?3)
             WHERE condition_id = ?1 AND outcome_index = ?2",
            params![condition_id, outcome_index, token_id],
        )?;
        // Trades that arrived before this token id was known stamped
        // condition_id/outcome_index as NULL at insert time; backfill them
        // now so metrics recompute sees the market's full trade history.
        conn.execute(
            "UPDATE trades SET condition_id = ?1, outcome_index = ?2
             WHERE token_id = ?3 AND condition_id IS NULL",
            params![condition_id, outcome_index, token_id],
        )?;
        Ok(())
    }

    async fn insert_transfer_if_new(&self, tx_hash: &str, log_index: u64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "INSERT INTO applied_transfers (tx_hash, log_index) VALUES (?1, ?2)
             ON CONFLICT(tx_hash, log_index) DO NOTHING",
            params![tx_hash, log_index as i64],
        )?;
        Ok(changes > 0)
    }

    async fn apply_balance_delta(
        &self,
        user: &str,
        token_id: &str,
        delta: Decimal,
        block: u64,
        tx_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        let existing: Option<String> = conn
            .query_row(
                "SELECT balance FROM balances WHERE user = ?1 AND token_id = ?2",
                params![user, token_id],
                |row| row.get(0),
            )
            .ok();

        let new_balance = match existing {
            Some(value) => dec(&value)? + delta,
            None => delta,
        };

        conn.execute(
            "INSERT INTO balances (user, token_id, balance, last_updated_block, last_updated_tx, last_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user, token_id) DO UPDATE SET
                balance = excluded.balance,
                last_updated_block = excluded.last_updated_block,
                last_updated_tx = excluded.last_updated_tx,
                last_updated_at = excluded.last_updated_at",
            params![
                user,
                token_id,
                new_balance.to_string(),
                block as i64,
                tx_hash,
                timestamp.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    async fn insert_trade_if_new(&self, trade: &Trade) -> Result<bool, StoreError> {
        let conn = self.conn.lock();

        let position = conn
            .query_row(
                "SELECT condition_id, outcome_index FROM position_tokens WHERE token_id = ?1",
                params![trade.token_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .ok();

        let (condition_id, outcome_index) = match position {
            Some((c, o)) => (Some(c), Some(o)),
            None => (None, None),
        };

        let changes = conn.execute(
            "INSERT INTO trades
                (tx_hash, log_index, block_number, block_timestamp, exchange_address, trader,
                 token_id, collateral_token, token_amount, collateral_amount, price, is_buy,
                 order_id, condition_id, outcome_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(tx_hash, log_index) DO NOTHING",
            params![
                trade.tx_hash,
                trade.log_index as i64,
                trade.block_number as i64,
                trade.block_timestamp,
                trade.exchange_address,
                trade.trader,
                trade.token_id,
                trade.collateral_token,
                trade.token_amount.to_string(),
                trade.collateral_amount.to_string(),
                trade.price.to_string(),
                trade.is_buy as i64,
                trade.order_id,
                condition_id,
                outcome_index,
            ],
        )?;

        Ok(changes > 0)
    }

    async fn sum_positive_balances_for_condition(
        &self,
        condition_id: &str,
    ) -> Result<Decimal, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT b.balance FROM balances b
             JOIN position_tokens pt ON pt.token_id = b.token_id
             WHERE pt.condition_id = ?1",
        )?;
        let rows = stmt.query_map([condition_id], |row| row.get::<_, String>(0))?;
        let mut total = Decimal::ZERO;
        for row in rows {
            let value = dec(&row?)?;
            if value.is_sign_positive() {
                total += value;
            }
        }
        Ok(total)
    }

    async fn get_user_market_position(
        &self,
        user: &str,
        condition_id: &str,
        outcome_index: u32,
    ) -> Result<Option<UserMarketPosition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM user_market_positions
             WHERE user = ?1 AND condition_id = ?2 AND outcome_index = ?3",
        )?;
        let mut rows = stmt.query(params![user, condition_id, outcome_index])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_user_market_position(row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_user_market_position(
        &self,
        position: &UserMarketPosition,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_market_positions
                (user, condition_id, outcome_index, total_shares_bought, total_shares_sold,
                 current_shares, total_cost_basis, total_proceeds, average_buy_price,
                 realized_pnl, first_trade_at, last_trade_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(user, condition_id, outcome_index) DO UPDATE SET
                total_shares_bought = excluded.total_shares_bought,
                total_shares_sold = excluded.total_shares_sold,
                current_shares = excluded.current_shares,
                total_cost_basis = excluded.total_cost_basis,
                total_proceeds = excluded.total_proceeds,
                average_buy_price = excluded.average_buy_price,
                realized_pnl = excluded.realized_pnl,
                last_trade_at = excluded.last_trade_at",
            params![
                position.user,
                position.condition_id,
                position.outcome_index,
                position.total_shares_bought.to_string(),
                position.total_shares_sold.to_string(),
                position.current_shares.to_string(),
                position.total_cost_basis.to_string(),
                position.total_proceeds.to_string(),
                position.average_buy_price.to_string(),
                position.realized_pnl.to_string(),
                position.first_trade_at.to_rfc3339(),
                position.last_trade_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn upsert_user_stats_on_trade(
        &self,
        user: &str,
        collateral_amount: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let ts_str = timestamp.to_rfc3339();

        let existing: Option<(String, i64, String, String)> = conn
            .query_row(
                "SELECT total_volume, total_trades, first_trade_at, last_trade_at
                 FROM user_stats WHERE user = ?1",
                [user],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .ok();

        let (new_volume, new_trades, first_trade_at, last_trade_at) = match existing {
            Some((vol, trades, first, last)) => {
                let new_volume = dec(&vol)? + collateral_amount;
                let last_dt = ts(&last)?.max(timestamp);
                let first_dt = ts(&first)?.min(timestamp);
                (new_volume, trades + 1, first_dt.to_rfc3339(), last_dt.to_rfc3339())
            }
            None => (collateral_amount, 1, ts_str.clone(), ts_str),
        };

        conn.execute(
            "INSERT INTO user_stats (user, total_volume, total_trades, first_trade_at, last_trade_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user) DO UPDATE SET
                total_volume = excluded.total_volume,
                total_trades = excluded.total_trades,
                first_trade_at = excluded.first_trade_at,
                last_trade_at = excluded.last_trade_at",
            params![user, new_volume.to_string(), new_trades as i64, first_trade_at, last_trade_at],
        )?;
        Ok(())
    }

    async fn insert_price_history_tick(&self, tick: &PriceHistoryTick) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_history
                (condition_id, outcome_index, block_number, timestamp, open, high, low, close, volume, trade_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tick.condition_id,
                tick.outcome_index,
                tick.block_number as i64,
                tick.timestamp,
                tick.open.to_string(),
                tick.high.to_string(),
                tick.low.to_string(),
                tick.close.to_string(),
                tick.volume.to_string(),
                tick.trade_count,
            ],
        )?;
        Ok(())
    }

    async fn recent_trades_on_outcome(
        &self,
        condition_id: &str,
        outcome_index: u32,
        limit: usize,
    ) -> Result<Vec<Trade>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM trades
             WHERE condition_id = ?1 AND outcome_index = ?2
             ORDER BY block_timestamp DESC, log_index DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![condition_id, outcome_index, limit as i64], row_to_trade)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn windowed_volume(
        &self,
        condition_id: &str,
        since_ts: i64,
    ) -> Result<Decimal, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT collateral_amount FROM trades
             WHERE condition_id = ?1 AND block_timestamp >= ?2",
        )?;
        let rows = stmt.query_map(params![condition_id, since_ts], |row| row.get::<_, String>(0))?;
        let mut total = Decimal::ZERO;
        for row in rows {
            total += dec(&row?)?;
        }
        Ok(total)
    }

    async fn trade_count_since(&self, condition_id: &str, since_ts: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE condition_id = ?1 AND block_timestamp >= ?2",
            params![condition_id, since_ts],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn unique_traders_since(
        &self,
        condition_id: &str,
        since_ts: i64,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT trader) FROM trades WHERE condition_id = ?1 AND block_timestamp >= ?2",
            params![condition_id, since_ts],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn upsert_market_metrics(&self, metrics: &MarketMetrics) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_metrics
                (condition_id, volume_1h, volume_4h, volume_12h, volume_24h, yes_price, no_price,
                 yes_price_12h_ago, yes_price_24h_ago, price_12h_change_pct, price_24h_change_pct,
                 total_liquidity, open_interest, trade_count_24h, unique_traders_24h,
                 price_momentum, volume_momentum, turnover_ratio, adjusted_volatility, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(condition_id) DO UPDATE SET
                volume_1h = excluded.volume_1h,
                volume_4h = excluded.volume_4h,
                volume_12h = excluded.volume_12h,
                volume_24h = excluded.volume_24h,
                yes_price = excluded.yes_price,
                no_price = excluded.no_price,
                yes_price_12h_ago = excluded.yes_price_12h_ago,
                yes_price_24h_ago = excluded.yes_price_24h_ago,
                price_12h_change_pct = excluded.price_12h_change_pct,
                price_24h_change_pct = excluded.price_24h_change_pct,
                total_liquidity = excluded.total_liquidity,
                open_interest = excluded.open_interest,
                trade_count_24h = excluded.trade_count_24h,
                unique_traders_24h = excluded.unique_traders_24h,
                price_momentum = excluded.price_momentum,
                volume_momentum = excluded.volume_momentum,
                turnover_ratio = excluded.turnover_ratio,
                adjusted_volatility = excluded.adjusted_volatility,
                computed_at = excluded.computed_at",
            params![
                metrics.condition_id,
                metrics.volume_1h.to_string(),
                metrics.volume_4h.to_string(),
                metrics.volume_12h.to_string(),
                metrics.volume_24h.to_string(),
                metrics.yes_price.to_string(),
                metrics.no_price.to_string(),
                metrics.yes_price_12h_ago.to_string(),
                metrics.yes_price_24h_ago.to_string(),
                metrics.price_12h_change_pct,
                metrics.price_24h_change_pct,
                metrics.total_liquidity.to_string(),
                metrics.open_interest.to_string(),
                metrics.trade_count_24h as i64,
                metrics.unique_traders_24h as i64,
                metrics.price_momentum,
                metrics.volume_momentum,
                metrics.turnover_ratio,
                metrics.adjusted_volatility,
                metrics.computed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn get_market_metrics(&self, condition_id: &str) -> Result<Option<MarketMetrics>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM market_metrics WHERE condition_id = ?1")?;
        let mut rows = stmt.query([condition_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(MarketMetrics {
            condition_id: row.get("condition_id")?,
            volume_1h: dec(&row.get::<_, String>("volume_1h")?)?,
            volume_4h: dec(&row.get::<_, String>("volume_4h")?)?,
            volume_12h: dec(&row.get::<_, String>("volume_12h")?)?,
            volume_24h: dec(&row.get::<_, String>("volume_24h")?)?,
            yes_price: dec(&row.get::<_, String>("yes_price")?)?,
            no_price: dec(&row.get::<_, String>("no_price")?)?,
            yes_price_12h_ago: dec(&row.get::<_, String>("yes_price_12h_ago")?)?,
            yes_price_24h_ago: dec(&row.get::<_, String>("yes_price_24h_ago")?)?,
            price_12h_change_pct: row.get("price_12h_change_pct")?,
            price_24h_change_pct: row.get("price_24h_change_pct")?,
            total_liquidity: dec(&row.get::<_, String>("total_liquidity")?)?,
            open_interest: dec(&row.get::<_, String>("open_interest")?)?,
            trade_count_24h: row.get::<_, i64>("trade_count_24h")? as u64,
            unique_traders_24h: row.get::<_, i64>("unique_traders_24h")? as u64,
            price_momentum: row.get("price_momentum")?,
            volume_momentum: row.get("volume_momentum")?,
            turnover_ratio: row.get("turnover_ratio")?,
            adjusted_volatility: row.get("adjusted_volatility")?,
            computed_at: row
                .get::<_, String>("computed_at")?
                .parse()
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn conditions_traded_since(&self, since_ts: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT condition_id FROM trades
             WHERE condition_id IS NOT NULL AND block_timestamp >= ?1",
        )?;
        let rows = stmt.query_map([since_ts], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn upsert_condition_metadata_coalesce(
        &self,
        descriptor: &CatalogDescriptor,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conditions WHERE condition_id = ?1",
            [&descriptor.condition_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(false);
        }

        conn.execute(
            "UPDATE conditions SET
                question = COALESCE(question, ?2),
                description = COALESCE(description, ?3),
                category = COALESCE(category, ?4),
                end_date = COALESCE(end_date, ?5),
                image_url = COALESCE(image_url, ?6)
             WHERE condition_id = ?1",
            params![
                descriptor.condition_id,
                descriptor.question,
                descriptor.description,
                descriptor.category,
                end_date.map(|d| d.to_rfc3339()),
                descriptor.image,
            ],
        )?;
        Ok(true)
    }

    async fn list_active_condition_ids(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT c.condition_id FROM conditions c
             LEFT JOIN (
                SELECT condition_id, MAX(block_timestamp) AS last_trade
                FROM trades WHERE condition_id IS NOT NULL
                GROUP BY condition_id
             ) t ON t.condition_id = c.condition_id
             WHERE c.resolved = 0
             ORDER BY t.last_trade DESC NULLS LAST
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn prune_price_history_older_than(&self, cutoff_ts: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM price_history
             WHERE timestamp < ?1
               AND condition_id NOT IN (SELECT condition_id FROM conditions WHERE resolved = 0)",
            params![cutoff_ts],
        )?;
        Ok(deleted)
    }

    async fn prune_event_log_older_than(&self, cutoff_ts: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let cutoff_block_ts = cutoff_ts;
        let deleted = conn.execute(
            "DELETE FROM event_log WHERE block_number IN (
                SELECT number FROM blocks WHERE timestamp < ?1
             )",
            params![cutoff_block_ts],
        )?;
        Ok(deleted)
    }

    async fn append_event_log(&self, row: &EventLogRow) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_log (block_number, tx_hash, log_index, contract_address, event_name, event_args_json, processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(tx_hash, log_index) DO UPDATE SET processed = excluded.processed",
            params![
                row.block_number as i64,
                row.tx_hash,
                row.log_index as i64,
                row.contract_address,
                row.event_name,
                row.event_args_json,
                row.processed as i64,
            ],
        )?;
        Ok(())
    }

    async fn get_active_markets(&self, limit: usize) -> Result<Vec<Condition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM conditions WHERE resolved = 0 ORDER BY created_at_block DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_condition)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn get_market_trades(&self, condition_id: &str, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM trades WHERE condition_id = ?1
             ORDER BY block_timestamp DESC, log_index DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![condition_id, limit as i64], row_to_trade)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn get_indexer_stats(&self) -> Result<Vec<IndexerState>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT name, last_processed_block, status, error_message, total_events_processed, updated_at
             FROM indexer_state ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IndexerState {
                name: row.get(0)?,
                last_processed_block: row.get::<_, i64>(1)? as u64,
                status: IndexerStatus::from_str(&row.get::<_, String>(2)?),
                error_message: row.get(3)?,
                total_events_processed: row.get::<_, i64>(4)? as u64,
                updated_at: row
                    .get::<_, String>(5)?
                    .parse()
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn get_top_positions(
        &self,
        condition_id: &str,
        limit: usize,
    ) -> Result<Vec<UserMarketPosition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM user_market_positions
             WHERE condition_id = ?1
             ORDER BY CAST(current_shares AS REAL) DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![condition_id, limit as i64], row_to_user_market_position)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn get_user_aggregate_stats(&self, user: &str) -> Result<Option<UserStats>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user, total_volume, total_trades, first_trade_at, last_trade_at
             FROM user_stats WHERE user = ?1",
        )?;
        let mut rows = stmt.query([user])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(UserStats {
            user: row.get(0)?,
            total_volume: dec(&row.get::<_, String>(1)?)?,
            total_trades: row.get::<_, i64>(2)? as u64,
            first_trade_at: row
                .get::<_, String>(3)?
                .parse()
                .unwrap_or_else(|_| Utc::now()),
            last_trade_at: row
                .get::<_, String>(4)?
                .parse()
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn get_user_positions(
        &self,
        user: &str,
        condition_id: &str,
    ) -> Result<Vec<UserMarketPosition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM user_market_positions WHERE user = ?1 AND condition_id = ?2
             ORDER BY outcome_index",
        )?;
        let rows = stmt.query_map(params![user, condition_id], row_to_user_market_position)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
