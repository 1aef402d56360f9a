//! JSON Lines ledger of closed positions.
//!
//! One file per UTC close date (`closed_positions_YYYY-MM-DD.jsonl`), opened
//! in append mode. Each line is a complete JSON object, so an interrupted
//! write only ever damages its own line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use autoclose_core::{CloseReason, PositionKind, Price, Size, Symbol};

use crate::error::{PersistenceError, PersistenceResult};

/// A closed position as written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPositionRecord {
    pub symbol: Symbol,
    pub kind: PositionKind,
    pub entry_price: Price,
    pub exit_price: Price,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub amount: Size,
    pub leverage: Decimal,
    pub pnl_usd: Decimal,
    pub pnl_percent: Decimal,
    pub fee: Option<Decimal>,
    pub reason: Option<CloseReason>,
    pub order_id: Option<String>,
    /// True when no reduce order was sent (already flat or liquidated).
    pub flatten_skipped: bool,
}

impl ClosedPositionRecord {
    /// Reject records missing the numbers every ledger row must carry.
    ///
    /// Prices of zero stand for data that never arrived.
    pub fn validate(&self) -> PersistenceResult<()> {
        if !self.entry_price.is_positive() {
            return Err(PersistenceError::InvalidRecord(format!(
                "{}: entry_price missing",
                self.symbol
            )));
        }
        if !self.exit_price.is_positive() {
            return Err(PersistenceError::InvalidRecord(format!(
                "{}: exit_price missing",
                self.symbol
            )));
        }
        Ok(())
    }
}

/// Active file for one date.
struct ActiveFile {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Append-only daily ledger of closed positions.
pub struct JsonLinesLedger {
    base_dir: PathBuf,
    active: Option<ActiveFile>,
}

impl JsonLinesLedger {
    /// Create a ledger writing under `base_dir`, creating it if needed.
    pub fn new(base_dir: impl AsRef<Path>) -> PersistenceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active: None,
        })
    }

    /// Path of the file holding closes from `date` (`YYYY-MM-DD`).
    #[must_use]
    pub fn file_for(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("closed_positions_{date}.jsonl"))
    }

    /// Validate and append one record, flushing it to disk.
    pub fn append(&mut self, record: &ClosedPositionRecord) -> PersistenceResult<()> {
        record.validate()?;

        let date = record.exit_time.format("%Y-%m-%d").to_string();
        let needs_rotation = self
            .active
            .as_ref()
            .map(|a| a.date != date)
            .unwrap_or(false);
        if needs_rotation {
            self.close_active();
        }

        let active = match self.active.as_mut() {
            Some(active) => active,
            None => self.active.insert(self.open_file(&date)?),
        };

        let json = serde_json::to_string(record)?;
        writeln!(active.writer, "{json}")?;
        active.writer.flush()?;
        active.records_written += 1;

        debug!(
            symbol = %record.symbol,
            date = %active.date,
            "Closed position appended to ledger"
        );
        Ok(())
    }

    fn open_file(&self, date: &str) -> PersistenceResult<ActiveFile> {
        let path = self.file_for(date);
        info!(path = %path.display(), "Opening ledger file (append mode)");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ActiveFile {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        })
    }

    fn close_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "Failed to flush ledger on close");
            }
            info!(
                date = %active.date,
                records = active.records_written,
                "Closed ledger file"
            );
        }
    }
}

impl Drop for JsonLinesLedger {
    fn drop(&mut self) {
        self.close_active();
    }
}
