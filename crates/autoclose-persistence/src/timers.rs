//! Persisted per-symbol hold timers.
//!
//! A timer row carries `entry_time` (the instant the current run started) and
//! `elapsed_time` (hold time accrued before that instant). Both are stored as
//! Unix seconds. Total elapsed at `now` is `elapsed_time + (now - entry_time)`.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use autoclose_core::Symbol;

use crate::error::{PersistenceError, PersistenceResult};
use crate::worker::{open_file, spawn_sqlite_worker, SqliteHandle, DEFAULT_QUEUE_CAPACITY};

const SCHEMA_TIMERS: &str = r#"
CREATE TABLE IF NOT EXISTS timers (
    symbol TEXT PRIMARY KEY,
    entry_time REAL NOT NULL,
    elapsed_time REAL NOT NULL DEFAULT 0
);
"#;

// ============================================================================
// TimerEntry
// ============================================================================

/// One persisted timer.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerEntry {
    pub symbol: Symbol,
    /// Start of the current run.
    pub started_at: DateTime<Utc>,
    /// Hold time accrued before `started_at`.
    pub elapsed: Duration,
}

impl TimerEntry {
    /// Total hold time at `now`. A `started_at` in the future counts as zero.
    #[must_use]
    pub fn total_elapsed(&self, now: DateTime<Utc>) -> Duration {
        let running = (now - self.started_at).to_std().unwrap_or(Duration::ZERO);
        self.elapsed + running
    }

    /// Whether the timer should be re-armed or closed right away.
    #[must_use]
    pub fn outcome(&self, now: DateTime<Utc>, hold: Duration) -> RestoreOutcome {
        let total = self.total_elapsed(now);
        if total >= hold {
            RestoreOutcome::Expired
        } else {
            RestoreOutcome::Rearm(hold - total)
        }
    }
}

/// What to do with a timer found at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Re-arm with the remaining hold time.
    Rearm(Duration),
    /// Hold time already elapsed; close now.
    Expired,
}

/// A persisted timer together with its restore decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredTimer {
    pub entry: TimerEntry,
    pub total_elapsed: Duration,
    pub outcome: RestoreOutcome,
}

fn to_unix(t: DateTime<Utc>) -> f64 {
    t.timestamp_micros() as f64 / 1_000_000.0
}

fn from_unix(secs: f64) -> PersistenceResult<DateTime<Utc>> {
    let micros = (secs * 1_000_000.0).round() as i64;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(micros.div_euclid(1_000_000), nanos)
        .single()
        .ok_or_else(|| PersistenceError::Corrupt {
            table: "timers",
            detail: format!("entry_time={secs}"),
        })
}

fn elapsed_from_secs(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

fn row_to_entry(symbol: String, entry_time: f64, elapsed: f64) -> PersistenceResult<TimerEntry> {
    Ok(TimerEntry {
        symbol: Symbol::new(symbol.as_str()).map_err(|_| PersistenceError::Corrupt {
            table: "timers",
            detail: format!("symbol={symbol:?}"),
        })?,
        started_at: from_unix(entry_time)?,
        elapsed: elapsed_from_secs(elapsed),
    })
}

// ============================================================================
// TimerStore
// ============================================================================

/// Persisted timer registry, served by a single-writer worker.
#[derive(Clone)]
pub struct TimerStore {
    db: SqliteHandle,
}

impl TimerStore {
    /// Open (or create) the timers database at `path`.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref();
        let store = Self::from_connection(open_file(path)?)?;
        info!(path = %path.display(), "Timer store opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> PersistenceResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> PersistenceResult<Self> {
        conn.execute_batch(SCHEMA_TIMERS)?;
        let (db, _join) = spawn_sqlite_worker("timers", conn, DEFAULT_QUEUE_CAPACITY)?;
        Ok(Self { db })
    }

    /// Insert a timer if none exists for `symbol`.
    ///
    /// Returns `true` if a new entry was created.
    pub async fn add(
        &self,
        symbol: &Symbol,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> PersistenceResult<bool> {
        let symbol = symbol.clone();
        self.db
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO timers (symbol, entry_time, elapsed_time) VALUES (?1, ?2, ?3)",
                    params![symbol.as_str(), to_unix(started_at), elapsed.as_secs_f64()],
                )?;
                if inserted > 0 {
                    debug!(symbol = %symbol, "Timer added");
                }
                Ok(inserted > 0)
            })
            .await
    }

    /// Checkpoint accrued hold time.
    ///
    /// Stores `elapsed` and rebases `started_at` to now, so the total is
    /// unchanged by the write. Returns `false` if no timer exists.
    pub async fn update_elapsed(&self, symbol: &Symbol, elapsed: Duration) -> PersistenceResult<bool> {
        let symbol = symbol.clone();
        let now = Utc::now();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE timers SET elapsed_time = ?1, entry_time = ?2 WHERE symbol = ?3",
                    params![elapsed.as_secs_f64(), to_unix(now), symbol.as_str()],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Delete the timer for `symbol`. Returns `true` if one existed.
    pub async fn remove(&self, symbol: &Symbol) -> PersistenceResult<bool> {
        let symbol = symbol.clone();
        self.db
            .call(move |conn| {
                let changed =
                    conn.execute("DELETE FROM timers WHERE symbol = ?1", params![symbol.as_str()])?;
                if changed > 0 {
                    debug!(symbol = %symbol, "Timer removed");
                }
                Ok(changed > 0)
            })
            .await
    }

    pub async fn has(&self, symbol: &Symbol) -> PersistenceResult<bool> {
        Ok(self.get(symbol).await?.is_some())
    }

    pub async fn get(&self, symbol: &Symbol) -> PersistenceResult<Option<TimerEntry>> {
        let symbol = symbol.clone();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT symbol, entry_time, elapsed_time FROM timers WHERE symbol = ?1",
                        params![symbol.as_str()],
                        |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?)),
                    )
                    .optional()?;
                row.map(|(s, t, e)| row_to_entry(s, t, e)).transpose()
            })
            .await
    }

    /// Every persisted timer, ordered by symbol.
    pub async fn list_all(&self) -> PersistenceResult<Vec<TimerEntry>> {
        self.db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT symbol, entry_time, elapsed_time FROM timers ORDER BY symbol")?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?)))?
                    .collect::<rusqlite::Result<Vec<(String, f64, f64)>>>()?;
                rows.into_iter()
                    .map(|(s, t, e)| row_to_entry(s, t, e))
                    .collect()
            })
            .await
    }

    /// Restore decisions for every persisted timer at `now`.
    ///
    /// Read-only: acting on the outcomes is up to the caller.
    pub async fn restore(
        &self,
        now: DateTime<Utc>,
        hold: Duration,
    ) -> PersistenceResult<Vec<RestoredTimer>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .map(|entry| RestoredTimer {
                total_elapsed: entry.total_elapsed(now),
                outcome: entry.outcome(now, hold),
                entry,
            })
            .collect())
    }

    /// Stop the worker after queued jobs complete.
    pub async fn shutdown(&self) {
        self.db.shutdown().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_is_insert_if_absent() {
        let store = TimerStore::open_in_memory().unwrap();
        let now = Utc::now();

        assert!(store.add(&sym("BTC-USDT"), now, Duration::ZERO).await.unwrap());
        assert!(!store
            .add(&sym("BTC-USDT"), now + ChronoDuration::seconds(60), Duration::from_secs(5))
            .await
            .unwrap());

        let entry = store.get(&sym("BTC-USDT")).await.unwrap().unwrap();
        assert_eq!(entry.elapsed, Duration::ZERO);
        assert!((entry.started_at - now).num_milliseconds().abs() < 1);
    }

    #[tokio::test]
    async fn test_remove_and_has() {
        let store = TimerStore::open_in_memory().unwrap();
        let btc = sym("BTC-USDT");

        store.add(&btc, Utc::now(), Duration::ZERO).await.unwrap();
        assert!(store.has(&btc).await.unwrap());
        assert!(store.remove(&btc).await.unwrap());
        assert!(!store.has(&btc).await.unwrap());
        assert!(!store.remove(&btc).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_elapsed_rebases_start() {
        let store = TimerStore::open_in_memory().unwrap();
        let btc = sym("BTC-USDT");
        let long_ago = Utc::now() - ChronoDuration::seconds(100);

        store.add(&btc, long_ago, Duration::ZERO).await.unwrap();
        assert!(store
            .update_elapsed(&btc, Duration::from_secs(100))
            .await
            .unwrap());

        let entry = store.get(&btc).await.unwrap().unwrap();
        let total = entry.total_elapsed(Utc::now());
        // 100s carried over, not 200s.
        assert!(total >= Duration::from_secs(100));
        assert!(total < Duration::from_secs(102));

        assert!(!store
            .update_elapsed(&sym("ETH-USDT"), Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_restore_outcomes() {
        let store = TimerStore::open_in_memory().unwrap();
        let now = Utc::now();
        let hold = Duration::from_secs(180);

        // Restart with 200s already accrued against a 180s hold.
        store
            .add(&sym("BTC-USDT"), now, Duration::from_secs(200))
            .await
            .unwrap();
        // 60s accrued plus 30s since the last start.
        store
            .add(
                &sym("ETH-USDT"),
                now - ChronoDuration::seconds(30),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let restored = store.restore(now, hold).await.unwrap();
        assert_eq!(restored.len(), 2);

        assert_eq!(restored[0].entry.symbol, sym("BTC-USDT"));
        assert_eq!(restored[0].outcome, RestoreOutcome::Expired);

        assert_eq!(restored[1].entry.symbol, sym("ETH-USDT"));
        match restored[1].outcome {
            RestoreOutcome::Rearm(remaining) => {
                let secs = remaining.as_secs_f64();
                assert!((secs - 90.0).abs() < 0.01, "remaining was {secs}");
            }
            RestoreOutcome::Expired => panic!("ETH timer should re-arm"),
        }
    }

    #[test]
    fn test_future_start_counts_as_zero() {
        let now = Utc::now();
        let entry = TimerEntry {
            symbol: sym("BTC-USDT"),
            started_at: now + ChronoDuration::seconds(30),
            elapsed: Duration::from_secs(10),
        };
        assert_eq!(entry.total_elapsed(now), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timers_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timers.db");

        {
            let store = TimerStore::open(&path).unwrap();
            store
                .add(&sym("BTC-USDT"), Utc::now(), Duration::from_secs(42))
                .await
                .unwrap();
            store.shutdown().await;
        }

        let store = TimerStore::open(&path).unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].elapsed, Duration::from_secs(42));
    }
}
