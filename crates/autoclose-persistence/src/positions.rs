//! Persisted positions table.
//!
//! `PositionStore` is the only writer of the `closed` flag. The uniqueness of
//! open rows per `(symbol, kind)` is enforced by a partial unique index, so a
//! duplicate open fails inside SQLite even when two callers race.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};
use rust_decimal::Decimal;
use tracing::{debug, info};

use autoclose_core::{CloseReason, OrderSide, PositionKind, Price, Size, Symbol};

use crate::error::{PersistenceError, PersistenceResult};
use crate::worker::{open_file, spawn_sqlite_worker, SqliteHandle, DEFAULT_QUEUE_CAPACITY};

// =============================================================================
// SCHEMA
// =============================================================================

const SCHEMA_POSITIONS: &str = r#"
CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    kind TEXT NOT NULL,            -- 'directional' or 'leveraged_short'
    entry_price TEXT NOT NULL,     -- decimals stored as text to stay exact
    entry_time TEXT NOT NULL,      -- RFC 3339
    exit_price TEXT,
    exit_time TEXT,
    pnl_percent TEXT,
    pnl_usd TEXT,
    amount TEXT NOT NULL,
    leverage TEXT NOT NULL DEFAULT '1',
    side TEXT NOT NULL,            -- 'buy' or 'sell'
    fee TEXT,
    order_id TEXT,
    reason TEXT,                   -- 'timeout', 'target', 'liquidation' or NULL
    closed INTEGER NOT NULL DEFAULT 0
);
"#;

const POSITIONS_INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_unique ON positions(symbol, kind) WHERE closed = 0;",
    "CREATE INDEX IF NOT EXISTS idx_positions_closed_exit_time ON positions(closed, exit_time DESC);",
];

const SELECT_COLUMNS: &str = "id, symbol, kind, entry_price, entry_time, exit_price, exit_time, \
     pnl_percent, pnl_usd, amount, leverage, side, fee, order_id, reason, closed";

// =============================================================================
// DATA STRUCTURES
// =============================================================================

/// Fields supplied when an open order is confirmed.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub entry_price: Price,
    pub entry_time: DateTime<Utc>,
    pub amount: Size,
    /// Must be `>= 1`.
    pub leverage: Decimal,
    /// Defaults to the kind's entry side.
    pub side: Option<OrderSide>,
    pub fee: Option<Decimal>,
    pub order_id: Option<String>,
}

impl NewPosition {
    /// Unleveraged position opened now.
    #[must_use]
    pub fn new(entry_price: Price, amount: Size) -> Self {
        Self {
            entry_price,
            entry_time: Utc::now(),
            amount,
            leverage: Decimal::ONE,
            side: None,
            fee: None,
            order_id: None,
        }
    }

    #[must_use]
    pub fn with_leverage(mut self, leverage: Decimal) -> Self {
        self.leverage = leverage;
        self
    }

    #[must_use]
    pub fn with_entry_time(mut self, entry_time: DateTime<Utc>) -> Self {
        self.entry_time = entry_time;
        self
    }

    #[must_use]
    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    #[must_use]
    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = Some(fee);
        self
    }
}

/// Exit data written once, at close.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitFields {
    pub exit_price: Price,
    pub exit_time: DateTime<Utc>,
    pub pnl_usd: Decimal,
    pub pnl_percent: Decimal,
    pub fee: Option<Decimal>,
    pub order_id: Option<String>,
    /// Size reported by the exchange at close; replaces the recorded amount.
    pub amount: Option<Size>,
}

/// One row of the positions table.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub id: i64,
    pub symbol: Symbol,
    pub kind: PositionKind,
    pub entry_price: Price,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Price>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl_percent: Option<Decimal>,
    pub pnl_usd: Option<Decimal>,
    pub amount: Size,
    pub leverage: Decimal,
    pub side: OrderSide,
    pub fee: Option<Decimal>,
    pub order_id: Option<String>,
    pub reason: Option<CloseReason>,
    pub closed: bool,
}

/// Result of a conditional close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseWrite {
    /// The open row was updated to closed.
    Committed,
    /// No open row matched; someone else closed it first.
    NoOp,
}

// =============================================================================
// ROW DECODING
// =============================================================================

/// Raw column values, decoded into domain types after the statement finishes.
struct RawPosition {
    id: i64,
    symbol: String,
    kind: String,
    entry_price: String,
    entry_time: String,
    exit_price: Option<String>,
    exit_time: Option<String>,
    pnl_percent: Option<String>,
    pnl_usd: Option<String>,
    amount: String,
    leverage: String,
    side: String,
    fee: Option<String>,
    order_id: Option<String>,
    reason: Option<String>,
    closed: bool,
}

impl RawPosition {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            symbol: row.get(1)?,
            kind: row.get(2)?,
            entry_price: row.get(3)?,
            entry_time: row.get(4)?,
            exit_price: row.get(5)?,
            exit_time: row.get(6)?,
            pnl_percent: row.get(7)?,
            pnl_usd: row.get(8)?,
            amount: row.get(9)?,
            leverage: row.get(10)?,
            side: row.get(11)?,
            fee: row.get(12)?,
            order_id: row.get(13)?,
            reason: row.get(14)?,
            closed: row.get(15)?,
        })
    }

    fn decode(self) -> PersistenceResult<PositionRecord> {
        let side = OrderSide::parse(&self.side).ok_or_else(|| corrupt("side", &self.side))?;
        Ok(PositionRecord {
            id: self.id,
            symbol: Symbol::new(self.symbol.as_str()).map_err(|_| corrupt("symbol", &self.symbol))?,
            kind: PositionKind::from_str(&self.kind).map_err(|_| corrupt("kind", &self.kind))?,
            entry_price: Price::new(decimal("entry_price", &self.entry_price)?),
            entry_time: timestamp("entry_time", &self.entry_time)?,
            exit_price: opt(self.exit_price, |s| decimal("exit_price", s).map(Price::new))?,
            exit_time: opt(self.exit_time, |s| timestamp("exit_time", s))?,
            pnl_percent: opt(self.pnl_percent, |s| decimal("pnl_percent", s))?,
            pnl_usd: opt(self.pnl_usd, |s| decimal("pnl_usd", s))?,
            amount: Size::new(decimal("amount", &self.amount)?),
            leverage: decimal("leverage", &self.leverage)?,
            side,
            fee: opt(self.fee, |s| decimal("fee", s))?,
            order_id: self.order_id,
            reason: opt(self.reason, |s| {
                CloseReason::from_str(s).map_err(|_| corrupt("reason", s))
            })?,
            closed: self.closed,
        })
    }
}

fn corrupt(column: &str, value: &str) -> PersistenceError {
    PersistenceError::Corrupt {
        table: "positions",
        detail: format!("{column}={value:?}"),
    }
}

fn decimal(column: &str, value: &str) -> PersistenceResult<Decimal> {
    Decimal::from_str(value).map_err(|_| corrupt(column, value))
}

fn timestamp(column: &str, value: &str) -> PersistenceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| corrupt(column, value))
}

fn opt<T>(
    value: Option<String>,
    f: impl FnOnce(&str) -> PersistenceResult<T>,
) -> PersistenceResult<Option<T>> {
    value.as_deref().map(f).transpose()
}

fn query_positions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> PersistenceResult<Vec<PositionRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params, RawPosition::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawPosition::decode).collect()
}

// =============================================================================
// POSITION STORE
// =============================================================================

/// Persisted positions, served by a single-writer worker.
#[derive(Clone)]
pub struct PositionStore {
    db: SqliteHandle,
}

impl PositionStore {
    /// Open (or create) the positions database at `path`.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref();
        let conn = open_file(path)?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Position store opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> PersistenceResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> PersistenceResult<Self> {
        conn.execute_batch(SCHEMA_POSITIONS)?;
        for index in POSITIONS_INDEXES {
            conn.execute_batch(index)?;
        }
        let (db, _join) = spawn_sqlite_worker("positions", conn, DEFAULT_QUEUE_CAPACITY)?;
        Ok(Self { db })
    }

    /// Insert a new open position.
    ///
    /// Fails with `AlreadyOpen` when an un-closed row exists for
    /// `(symbol, kind)`. Returns the new row id.
    pub async fn open_position(
        &self,
        symbol: &Symbol,
        kind: PositionKind,
        fields: NewPosition,
    ) -> PersistenceResult<i64> {
        if fields.leverage < Decimal::ONE {
            return Err(PersistenceError::InvalidRecord(format!(
                "leverage must be >= 1, got {}",
                fields.leverage
            )));
        }
        if !fields.entry_price.is_positive() || !fields.amount.is_positive() {
            return Err(PersistenceError::InvalidRecord(format!(
                "entry_price and amount must be positive ({} / {})",
                fields.entry_price, fields.amount
            )));
        }

        let symbol = symbol.clone();
        let side = fields.side.unwrap_or_else(|| kind.entry_side());

        self.db
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO positions \
                     (symbol, kind, entry_price, entry_time, amount, leverage, side, fee, order_id, closed) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
                    params![
                        symbol.as_str(),
                        kind.as_str(),
                        fields.entry_price.to_string(),
                        fields.entry_time.to_rfc3339(),
                        fields.amount.to_string(),
                        fields.leverage.to_string(),
                        side.as_str(),
                        fields.fee.map(|f| f.to_string()),
                        fields.order_id,
                    ],
                );

                match inserted {
                    Ok(_) => {
                        let id = conn.last_insert_rowid();
                        debug!(symbol = %symbol, kind = %kind, id, "Position opened");
                        Ok(id)
                    }
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        Err(PersistenceError::AlreadyOpen {
                            symbol: symbol.to_string(),
                            kind: kind.to_string(),
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// The open row for `symbol`, if any.
    ///
    /// When both kinds are open for the symbol the most recent row wins.
    pub async fn lookup_open(&self, symbol: &Symbol) -> PersistenceResult<Option<PositionRecord>> {
        let symbol = symbol.clone();
        self.db
            .call(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM positions \
                     WHERE symbol = ?1 AND closed = 0 ORDER BY id DESC LIMIT 1"
                );
                Ok(query_positions(conn, &sql, params![symbol.as_str()])?
                    .into_iter()
                    .next())
            })
            .await
    }

    /// The open row for `(symbol, kind)`, if any.
    pub async fn lookup_open_kind(
        &self,
        symbol: &Symbol,
        kind: PositionKind,
    ) -> PersistenceResult<Option<PositionRecord>> {
        let symbol = symbol.clone();
        self.db
            .call(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM positions \
                     WHERE symbol = ?1 AND kind = ?2 AND closed = 0"
                );
                Ok(query_positions(conn, &sql, params![symbol.as_str(), kind.as_str()])?
                    .into_iter()
                    .next())
            })
            .await
    }

    /// Atomically close the open row for `(symbol, kind)`.
    ///
    /// Only a row with `closed = 0` is touched, so at most one caller ever
    /// observes `Committed` for a given position.
    pub async fn close(
        &self,
        symbol: &Symbol,
        kind: PositionKind,
        exit: ExitFields,
        reason: CloseReason,
    ) -> PersistenceResult<CloseWrite> {
        let symbol = symbol.clone();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE positions SET \
                         exit_price = ?1, exit_time = ?2, pnl_usd = ?3, pnl_percent = ?4, \
                         fee = COALESCE(?5, fee), order_id = COALESCE(?6, order_id), \
                         amount = COALESCE(?10, amount), reason = ?7, closed = 1 \
                     WHERE symbol = ?8 AND kind = ?9 AND closed = 0",
                    params![
                        exit.exit_price.to_string(),
                        exit.exit_time.to_rfc3339(),
                        exit.pnl_usd.to_string(),
                        exit.pnl_percent.to_string(),
                        exit.fee.map(|f| f.to_string()),
                        exit.order_id,
                        reason.as_str(),
                        symbol.as_str(),
                        kind.as_str(),
                        exit.amount.map(|a| a.to_string()),
                    ],
                )?;

                if changed == 0 {
                    debug!(symbol = %symbol, kind = %kind, "Close found no open row");
                    Ok(CloseWrite::NoOp)
                } else {
                    Ok(CloseWrite::Committed)
                }
            })
            .await
    }

    /// Snapshot of every open position, oldest first.
    pub async fn list_open(&self) -> PersistenceResult<Vec<PositionRecord>> {
        self.db
            .call(|conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM positions WHERE closed = 0 ORDER BY id ASC"
                );
                query_positions(conn, &sql, [])
            })
            .await
    }

    /// Most recently closed positions, newest first.
    pub async fn list_closed(&self, limit: usize) -> PersistenceResult<Vec<PositionRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM positions WHERE closed = 1 \
                     ORDER BY exit_time DESC, id DESC LIMIT ?1"
                );
                query_positions(conn, &sql, params![limit])
            })
            .await
    }

    /// Stop the worker after queued jobs complete.
    pub async fn shutdown(&self) {
        self.db.shutdown().await;
    }
}

// =============================================================================
// TESTS
// =============================================================================
