//! Persistence for §3's entities: `Position`, `Trade`, `ArbitrageOpportunity`,
//! `OpportunityEndHistory`, `CredentialRecord`. A single `rusqlite` (bundled)
//! connection behind a `tokio::sync::Mutex`, grounded on the teacher's
//! `vault/vault_db.rs` (schema created in `new`, `prepare_cached` queries,
//! scalar columns for the fields callers filter/sort on, a JSON TEXT column
//! for the nested substructures). No migration engine — out of scope per
//! spec.md §1.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    ArbitrageOpportunity, CanonicalSymbol, CloseReason, ConditionalOrderState, Exchange,
    OpportunityEndHistory, OpportunityStatus, Position, PositionStatus, StopOrTakeConfig, Trade,
    TradeStatus,
};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open sqlite store")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite store")?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- Position ----------------------------------------------------

    pub async fn upsert_position(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        let legs = LegBlob::from_position(position);
        conn.execute(
            "INSERT INTO positions (
                id, user_id, group_id, symbol, long_exchange, short_exchange,
                long_leverage, short_leverage, status, close_reason, closed_at,
                failure_reason, exit_suggested, exit_suggested_reason,
                created_at, legs_json
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
            ON CONFLICT(id) DO UPDATE SET
                status=excluded.status, close_reason=excluded.close_reason,
                closed_at=excluded.closed_at, failure_reason=excluded.failure_reason,
                exit_suggested=excluded.exit_suggested,
                exit_suggested_reason=excluded.exit_suggested_reason,
                legs_json=excluded.legs_json",
            params![
                position.id.to_string(),
                position.user_id.to_string(),
                position.group_id.map(|g| g.to_string()),
                position.symbol.as_str(),
                position.long_exchange.as_str(),
                position.short_exchange.as_str(),
                position.long_leverage.to_string(),
                position.short_leverage.to_string(),
                status_str(position.status),
                position.close_reason.map(close_reason_str),
                position.closed_at.map(|t| t.to_rfc3339()),
                position.failure_reason,
                position.exit_suggested,
                position.exit_suggested_reason.map(|r| format!("{r:?}")),
                position.created_at.to_rfc3339(),
                serde_json::to_string(&legs).context("serialize position legs")?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_position(&self, id: Uuid) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM positions WHERE id = ?1")?;
        let row = stmt
            .query_row(params![id.to_string()], row_to_position)
            .optional()?;
        Ok(row)
    }

    pub async fn list_positions_by_status(&self, status: PositionStatus) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM positions WHERE status = ?1")?;
        let rows = stmt
            .query_map(params![status_str(status)], row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Positions with `status=OPEN AND conditionalOrderStatus=SET`, the
    /// Conditional-Order Monitor's tick-1 filter (spec.md §4.7 step 1).
    pub async fn list_open_positions_with_conditional_orders_set(&self) -> Result<Vec<Position>> {
        let open = self.list_positions_by_status(PositionStatus::Open).await?;
        Ok(open
            .into_iter()
            .filter(|p| p.conditional_orders.status() == crate::domain::ConditionalOrderStatus::Set)
            .collect())
    }

    pub async fn list_positions_in_group(&self, group_id: Uuid) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM positions WHERE group_id = ?1")?;
        let rows = stmt
            .query_map(params![group_id.to_string()], row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn list_positions_for_user(&self, user_id: Uuid) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM positions WHERE user_id = ?1")?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- Trade ---------------------------------------------------------

    pub async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades (
                id, position_id, long_entry_price, short_entry_price,
                long_exit_price, short_exit_price, long_size, short_size,
                holding_duration_ms, price_diff_pnl, funding_rate_pnl,
                total_pnl, roi, status, closed_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                trade.id.to_string(),
                trade.position_id.to_string(),
                trade.long_entry_price.to_string(),
                trade.short_entry_price.to_string(),
                trade.long_exit_price.to_string(),
                trade.short_exit_price.to_string(),
                trade.long_size.to_string(),
                trade.short_size.to_string(),
                trade.holding_duration_ms,
                trade.price_diff_pnl.to_string(),
                trade.funding_rate_pnl.to_string(),
                trade.total_pnl.to_string(),
                trade.roi.to_string(),
                trade_status_str(trade.status),
                trade.closed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_trade(&self, id: Uuid) -> Result<Option<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM trades WHERE id = ?1")?;
        let row = stmt
            .query_row(params![id.to_string()], row_to_trade)
            .optional()?;
        Ok(row)
    }

    pub async fn list_trades(&self, limit: i64, offset: i64) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM trades ORDER BY closed_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], row_to_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- ArbitrageOpportunity / OpportunityEndHistory ------------------

    pub async fn upsert_opportunity(&self, opp: &ArbitrageOpportunity) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO opportunities (
                id, symbol, long_exchange, short_exchange, detected_at,
                disappeared_at, initial_spread, current_spread, max_spread,
                max_spread_at, status, notification_count, user_id
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
            ON CONFLICT(id) DO UPDATE SET
                disappeared_at=excluded.disappeared_at,
                current_spread=excluded.current_spread,
                max_spread=excluded.max_spread, max_spread_at=excluded.max_spread_at,
                status=excluded.status, notification_count=excluded.notification_count",
            params![
                opp.id.to_string(),
                opp.symbol.as_str(),
                opp.long_exchange.as_str(),
                opp.short_exchange.as_str(),
                opp.detected_at.to_rfc3339(),
                opp.disappeared_at.map(|t| t.to_rfc3339()),
                opp.initial_spread.to_string(),
                opp.current_spread.to_string(),
                opp.max_spread.to_string(),
                opp.max_spread_at.to_rfc3339(),
                opportunity_status_str(opp.status),
                opp.notification_count,
                opp.user_id.map(|u| u.to_string()),
            ],
        )?;
        Ok(())
    }

    pub async fn list_active_opportunities(&self, symbol: Option<&str>) -> Result<Vec<ArbitrageOpportunity>> {
        let conn = self.conn.lock().await;
        match symbol {
            Some(s) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM opportunities WHERE status = 'ACTIVE' AND symbol = ?1",
                )?;
                Ok(stmt
                    .query_map(params![s], row_to_opportunity)?
                    .collect::<rusqlite::Result<Vec<_>>>()?)
            }
            None => {
                let mut stmt =
                    conn.prepare_cached("SELECT * FROM opportunities WHERE status = 'ACTIVE'")?;
                Ok(stmt
                    .query_map([], row_to_opportunity)?
                    .collect::<rusqlite::Result<Vec<_>>>()?)
            }
        }
    }

    pub async fn insert_opportunity_end_history(&self, row: &OpportunityEndHistory) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO opportunity_end_history (
                id, symbol, long_exchange, short_exchange, detected_at,
                disappeared_at, duration_ms, initial_spread, final_spread, max_spread,
                realized_apy
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                row.id.to_string(),
                row.symbol.as_str(),
                row.long_exchange.as_str(),
                row.short_exchange.as_str(),
                row.detected_at.to_rfc3339(),
                row.disappeared_at.to_rfc3339(),
                row.duration_ms,
                row.initial_spread.to_string(),
                row.final_spread.to_string(),
                row.max_spread.to_string(),
                row.realized_apy.to_string(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_opportunity_end_history(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OpportunityEndHistory>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM opportunity_end_history ORDER BY disappeared_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], row_to_end_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- Credentials (C8) ---------------------------------------------

    pub async fn upsert_credential(&self, row: &CredentialRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO credentials (
                user_id, exchange, encrypted_key, encrypted_secret,
                encrypted_passphrase, is_active, environment
            ) VALUES (?1,?2,?3,?4,?5,?6,?7)
            ON CONFLICT(user_id, exchange) DO UPDATE SET
                encrypted_key=excluded.encrypted_key,
                encrypted_secret=excluded.encrypted_secret,
                encrypted_passphrase=excluded.encrypted_passphrase,
                is_active=excluded.is_active, environment=excluded.environment",
            params![
                row.user_id.to_string(),
                row.exchange.as_str(),
                row.encrypted_key,
                row.encrypted_secret,
                row.encrypted_passphrase,
                row.is_active,
                row.environment,
            ],
        )?;
        Ok(())
    }

    pub async fn get_credential(&self, user_id: Uuid, exchange: Exchange) -> Result<Option<CredentialRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, exchange, encrypted_key, encrypted_secret, encrypted_passphrase,
                    is_active, environment
             FROM credentials WHERE user_id = ?1 AND exchange = ?2",
        )?;
        let row = stmt
            .query_row(params![user_id.to_string(), exchange.as_str()], |r| {
                Ok(CredentialRow {
                    user_id: Uuid::parse_str(&r.get::<_, String>(0)?).unwrap_or_default(),
                    exchange: r.get::<_, String>(1)?.parse().unwrap_or(Exchange::Binance),
                    encrypted_key: r.get(2)?,
                    encrypted_secret: r.get(3)?,
                    encrypted_passphrase: r.get(4)?,
                    is_active: r.get(5)?,
                    environment: r.get(6)?,
                })
            })
            .optional()?;
        Ok(row)
    }
}

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub user_id: Uuid,
    pub exchange: Exchange,
    pub encrypted_key: String,
    pub encrypted_secret: String,
    pub encrypted_passphrase: Option<String>,
    pub is_active: bool,
    /// `MAINNET` or `TESTNET`.
    pub environment: String,
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            group_id TEXT,
            symbol TEXT NOT NULL,
            long_exchange TEXT NOT NULL,
            short_exchange TEXT NOT NULL,
            long_leverage TEXT NOT NULL,
            short_leverage TEXT NOT NULL,
            status TEXT NOT NULL,
            close_reason TEXT,
            closed_at TEXT,
            failure_reason TEXT,
            exit_suggested INTEGER NOT NULL,
            exit_suggested_reason TEXT,
            created_at TEXT NOT NULL,
            legs_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id);
        CREATE INDEX IF NOT EXISTS idx_positions_group ON positions(group_id);
        CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            position_id TEXT NOT NULL,
            long_entry_price TEXT NOT NULL,
            short_entry_price TEXT NOT NULL,
            long_exit_price TEXT NOT NULL,
            short_exit_price TEXT NOT NULL,
            long_size TEXT NOT NULL,
            short_size TEXT NOT NULL,
            holding_duration_ms INTEGER NOT NULL,
            price_diff_pnl TEXT NOT NULL,
            funding_rate_pnl TEXT NOT NULL,
            total_pnl TEXT NOT NULL,
            roi TEXT NOT NULL,
            status TEXT NOT NULL,
            closed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_position ON trades(position_id);
        CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON trades(closed_at DESC);

        CREATE TABLE IF NOT EXISTS opportunities (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            long_exchange TEXT NOT NULL,
            short_exchange TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            disappeared_at TEXT,
            initial_spread TEXT NOT NULL,
            current_spread TEXT NOT NULL,
            max_spread TEXT NOT NULL,
            max_spread_at TEXT NOT NULL,
            status TEXT NOT NULL,
            notification_count INTEGER NOT NULL,
            user_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_opportunities_status ON opportunities(status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_opportunities_active_triplet
            ON opportunities(symbol, long_exchange, short_exchange)
            WHERE status = 'ACTIVE';

        CREATE TABLE IF NOT EXISTS opportunity_end_history (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            long_exchange TEXT NOT NULL,
            short_exchange TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            disappeared_at TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            initial_spread TEXT NOT NULL,
            final_spread TEXT NOT NULL,
            max_spread TEXT NOT NULL,
            realized_apy TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_opp_history_disappeared ON opportunity_end_history(disappeared_at DESC);

        CREATE TABLE IF NOT EXISTS credentials (
            user_id TEXT NOT NULL,
            exchange TEXT NOT NULL,
            encrypted_key TEXT NOT NULL,
            encrypted_secret TEXT NOT NULL,
            encrypted_passphrase TEXT,
            is_active INTEGER NOT NULL,
            environment TEXT NOT NULL,
            PRIMARY KEY (user_id, exchange)
        );",
    )?;
    Ok(())
}

// --- row <-> domain mapping ---------------------------------------------

/// Nested per-leg fields (`StopOrTakeConfig` x4, `ConditionalOrderState`,
/// entry/exit prices and sizes, funding-rate snapshots) bundled as one JSON
/// column — these are read/written as a unit and never individually
/// queried, so a relational explosion of columns buys nothing here.
#[derive(serde::Serialize, serde::Deserialize)]
struct LegBlob {
    long_entry_price: Option<String>,
    short_entry_price: Option<String>,
    long_size: Option<String>,
    short_size: Option<String>,
    open_funding_rate_long: Option<String>,
    open_funding_rate_short: Option<String>,
    long_stop_loss: StopOrTakeConfig,
    long_take_profit: StopOrTakeConfig,
    short_stop_loss: StopOrTakeConfig,
    short_take_profit: StopOrTakeConfig,
    conditional_orders: ConditionalOrderState,
    long_exit_price: Option<String>,
    short_exit_price: Option<String>,
    cached_funding_pnl: Option<String>,
}

impl LegBlob {
    fn from_position(p: &Position) -> Self {
        Self {
            long_entry_price: p.long_entry_price.map(|d| d.to_string()),
            short_entry_price: p.short_entry_price.map(|d| d.to_string()),
            long_size: p.long_size.map(|d| d.to_string()),
            short_size: p.short_size.map(|d| d.to_string()),
            open_funding_rate_long: p.open_funding_rate_long.map(|d| d.to_string()),
            open_funding_rate_short: p.open_funding_rate_short.map(|d| d.to_string()),
            long_stop_loss: p.long_stop_loss.clone(),
            long_take_profit: p.long_take_profit.clone(),
            short_stop_loss: p.short_stop_loss.clone(),
            short_take_profit: p.short_take_profit.clone(),
            conditional_orders: p.conditional_orders.clone(),
            long_exit_price: p.long_exit_price.map(|d| d.to_string()),
            short_exit_price: p.short_exit_price.map(|d| d.to_string()),
            cached_funding_pnl: p.cached_funding_pnl.map(|d| d.to_string()),
        }
    }
}

fn parse_dec(s: &Option<String>) -> Option<rust_decimal::Decimal> {
    s.as_deref().and_then(|s| s.parse().ok())
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let legs_json: String = row.get("legs_json")?;
    let legs: LegBlob = serde_json::from_str(&legs_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let close_reason: Option<String> = row.get("close_reason")?;
    let closed_at: Option<String> = row.get("closed_at")?;
    let exit_suggested_reason: Option<String> = row.get("exit_suggested_reason")?;

    Ok(Position {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap_or_default(),
        group_id: row
            .get::<_, Option<String>>("group_id")?
            .and_then(|g| Uuid::parse_str(&g).ok()),
        symbol: CanonicalSymbol::new(row.get::<_, String>("symbol")?),
        long_exchange: row.get::<_, String>("long_exchange")?.parse().unwrap_or(Exchange::Binance),
        short_exchange: row.get::<_, String>("short_exchange")?.parse().unwrap_or(Exchange::Binance),
        long_entry_price: parse_dec(&legs.long_entry_price),
        short_entry_price: parse_dec(&legs.short_entry_price),
        long_size: parse_dec(&legs.long_size),
        short_size: parse_dec(&legs.short_size),
        long_leverage: row.get::<_, String>("long_leverage")?.parse().unwrap_or_default(),
        short_leverage: row.get::<_, String>("short_leverage")?.parse().unwrap_or_default(),
        open_funding_rate_long: parse_dec(&legs.open_funding_rate_long),
        open_funding_rate_short: parse_dec(&legs.open_funding_rate_short),
        status: parse_position_status(&row.get::<_, String>("status")?),
        long_stop_loss: legs.long_stop_loss,
        long_take_profit: legs.long_take_profit,
        short_stop_loss: legs.short_stop_loss,
        short_take_profit: legs.short_take_profit,
        conditional_orders: legs.conditional_orders,
        close_reason: close_reason.as_deref().map(parse_close_reason),
        closed_at: closed_at.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&Utc)),
        long_exit_price: parse_dec(&legs.long_exit_price),
        short_exit_price: parse_dec(&legs.short_exit_price),
        cached_funding_pnl: parse_dec(&legs.cached_funding_pnl),
        exit_suggested: row.get("exit_suggested")?,
        exit_suggested_reason: exit_suggested_reason.map(|r| match r.as_str() {
            "ApyNegative" => crate::domain::ExitSuggestedReason::ApyNegative,
            _ => crate::domain::ExitSuggestedReason::ProfitLockable,
        }),
        failure_reason: row.get("failure_reason")?,
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("created_at")?)
            .unwrap()
            .with_timezone(&Utc),
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        position_id: Uuid::parse_str(&row.get::<_, String>("position_id")?).unwrap_or_default(),
        long_entry_price: row.get::<_, String>("long_entry_price")?.parse().unwrap_or_default(),
        short_entry_price: row.get::<_, String>("short_entry_price")?.parse().unwrap_or_default(),
        long_exit_price: row.get::<_, String>("long_exit_price")?.parse().unwrap_or_default(),
        short_exit_price: row.get::<_, String>("short_exit_price")?.parse().unwrap_or_default(),
        long_size: row.get::<_, String>("long_size")?.parse().unwrap_or_default(),
        short_size: row.get::<_, String>("short_size")?.parse().unwrap_or_default(),
        holding_duration_ms: row.get("holding_duration_ms")?,
        price_diff_pnl: row.get::<_, String>("price_diff_pnl")?.parse().unwrap_or_default(),
        funding_rate_pnl: row.get::<_, String>("funding_rate_pnl")?.parse().unwrap_or_default(),
        total_pnl: row.get::<_, String>("total_pnl")?.parse().unwrap_or_default(),
        roi: row.get::<_, String>("roi")?.parse().unwrap_or_default(),
        status: match row.get::<_, String>("status")?.as_str() {
            "PARTIAL" => TradeStatus::Partial,
            _ => TradeStatus::Success,
        },
        closed_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("closed_at")?)
            .unwrap()
            .with_timezone(&Utc),
    })
}

fn row_to_opportunity(row: &rusqlite::Row) -> rusqlite::Result<ArbitrageOpportunity> {
    let disappeared_at: Option<String> = row.get("disappeared_at")?;
    Ok(ArbitrageOpportunity {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        symbol: CanonicalSymbol::new(row.get::<_, String>("symbol")?),
        long_exchange: row.get::<_, String>("long_exchange")?.parse().unwrap_or(Exchange::Binance),
        short_exchange: row.get::<_, String>("short_exchange")?.parse().unwrap_or(Exchange::Binance),
        detected_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("detected_at")?)
            .unwrap()
            .with_timezone(&Utc),
        disappeared_at: disappeared_at
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc)),
        initial_spread: row.get::<_, String>("initial_spread")?.parse().unwrap_or_default(),
        current_spread: row.get::<_, String>("current_spread")?.parse().unwrap_or_default(),
        max_spread: row.get::<_, String>("max_spread")?.parse().unwrap_or_default(),
        max_spread_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("max_spread_at")?)
            .unwrap()
            .with_timezone(&Utc),
        status: match row.get::<_, String>("status")?.as_str() {
            "ENDED" => OpportunityStatus::Ended,
            _ => OpportunityStatus::Active,
        },
        notification_count: row.get("notification_count")?,
        user_id: row
            .get::<_, Option<String>>("user_id")?
            .and_then(|u| Uuid::parse_str(&u).ok()),
    })
}

fn row_to_end_history(row: &rusqlite::Row) -> rusqlite::Result<OpportunityEndHistory> {
    Ok(OpportunityEndHistory {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap_or_default(),
        symbol: CanonicalSymbol::new(row.get::<_, String>("symbol")?),
        long_exchange: row.get::<_, String>("long_exchange")?.parse().unwrap_or(Exchange::Binance),
        short_exchange: row.get::<_, String>("short_exchange")?.parse().unwrap_or(Exchange::Binance),
        detected_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("detected_at")?)
            .unwrap()
            .with_timezone(&Utc),
        disappeared_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("disappeared_at")?)
            .unwrap()
            .with_timezone(&Utc),
        duration_ms: row.get("duration_ms")?,
        initial_spread: row.get::<_, String>("initial_spread")?.parse().unwrap_or_default(),
        final_spread: row.get::<_, String>("final_spread")?.parse().unwrap_or_default(),
        max_spread: row.get::<_, String>("max_spread")?.parse().unwrap_or_default(),
        realized_apy: row.get::<_, String>("realized_apy")?.parse().unwrap_or_default(),
    })
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Pending => "PENDING",
        PositionStatus::Open => "OPEN",
        PositionStatus::Partial => "PARTIAL",
        PositionStatus::Closing => "CLOSING",
        PositionStatus::Closed => "CLOSED",
        PositionStatus::Failed => "FAILED",
    }
}

fn parse_position_status(s: &str) -> PositionStatus {
    match s {
        "OPEN" => PositionStatus::Open,
        "PARTIAL" => PositionStatus::Partial,
        "CLOSING" => PositionStatus::Closing,
        "CLOSED" => PositionStatus::Closed,
        "FAILED" => PositionStatus::Failed,
        _ => PositionStatus::Pending,
    }
}

fn close_reason_str(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::Manual => "MANUAL",
        CloseReason::LongSlTriggered => "LONG_SL_TRIGGERED",
        CloseReason::LongTpTriggered => "LONG_TP_TRIGGERED",
        CloseReason::ShortSlTriggered => "SHORT_SL_TRIGGERED",
        CloseReason::ShortTpTriggered => "SHORT_TP_TRIGGERED",
        CloseReason::BothTriggered => "BOTH_TRIGGERED",
        CloseReason::UnconfirmedTrigger => "UNCONFIRMED_TRIGGER",
        CloseReason::BatchClose => "BATCH_CLOSE",
    }
}

fn parse_close_reason(s: &str) -> CloseReason {
    match s {
        "LONG_SL_TRIGGERED" => CloseReason::LongSlTriggered,
        "LONG_TP_TRIGGERED" => CloseReason::LongTpTriggered,
        "SHORT_SL_TRIGGERED" => CloseReason::ShortSlTriggered,
        "SHORT_TP_TRIGGERED" => CloseReason::ShortTpTriggered,
        "BOTH_TRIGGERED" => CloseReason::BothTriggered,
        "UNCONFIRMED_TRIGGER" => CloseReason::UnconfirmedTrigger,
        "BATCH_CLOSE" => CloseReason::BatchClose,
        _ => CloseReason::Manual,
    }
}

fn trade_status_str(status: TradeStatus) -> &'static str {
    match status {
        TradeStatus::Success => "SUCCESS",
        TradeStatus::Partial => "PARTIAL",
    }
}

fn opportunity_status_str(status: OpportunityStatus) -> &'static str {
    match status {
        OpportunityStatus::Active => "ACTIVE",
        OpportunityStatus::Ended => "ENDED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CanonicalSymbol;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn position_round_trips_through_sqlite() {
        let store = Store::open_in_memory().unwrap();
        let mut position = Position::new_pending(
            Uuid::new_v4(),
            CanonicalSymbol::new("BTCUSDT"),
            Exchange::Binance,
            Exchange::Okx,
            dec!(1),
            dec!(1),
        );
        position.status = PositionStatus::Open;
        position.long_entry_price = Some(dec!(50000));
        store.upsert_position(&position).await.unwrap();

        let loaded = store.get_position(position.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PositionStatus::Open);
        assert_eq!(loaded.long_entry_price, Some(dec!(50000)));
        assert_eq!(loaded.symbol, position.symbol);
    }

    #[tokio::test]
    async fn batch_close_scenario_drops_already_closed_positions() {
        let store = Store::open_in_memory().unwrap();
        let group_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        for i in 0..3 {
            let mut position = Position::new_pending(
                user_id,
                CanonicalSymbol::new("BTCUSDT"),
                Exchange::Binance,
                Exchange::Okx,
                dec!(1),
                dec!(1),
            );
            position.group_id = Some(group_id);
            position.status = if i == 1 {
                PositionStatus::Closed
            } else {
                PositionStatus::Open
            };
            store.upsert_position(&position).await.unwrap();
        }

        let group = store.list_positions_in_group(group_id).await.unwrap();
        let open: Vec<_> = group
            .into_iter()
            .filter(|p| p.status == PositionStatus::Open)
            .collect();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn opportunity_end_history_is_deidentified() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mut opp = ArbitrageOpportunity::new(
            CanonicalSymbol::new("BTCUSDT"),
            Exchange::Okx,
            Exchange::Binance,
            dec!(0.0006),
            dec!(0.219),
            now,
        );
        let history = opp.end(now + chrono::Duration::seconds(30));
        store.insert_opportunity_end_history(&history).await.unwrap();

        let rows = store.list_opportunity_end_history(10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        // OpportunityEndHistory has no userId/notificationCount fields at all.
        assert_eq!(rows[0].duration_ms, 30_000);
    }
}
