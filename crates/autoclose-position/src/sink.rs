//! Outbound sinks for closed positions.
//!
//! Delivery is best-effort: a failing sink is logged by the monitor and never
//! rolls back a committed close.

use std::sync::atomic::{AtomicBool, Ordering};

use rust_decimal::Decimal;

use autoclose_core::{CloseReason, PositionKind, Price, Symbol};
use autoclose_persistence::ClosedPositionRecord;

use crate::error::{PositionError, PositionResult};
use crate::gateway::BoxFuture;

/// Human-facing summary of a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNotice {
    pub symbol: Symbol,
    pub kind: PositionKind,
    pub entry_price: Price,
    pub exit_price: Price,
    pub pnl_percent: Decimal,
    pub pnl_usd: Decimal,
    pub reason: Option<CloseReason>,
    pub fee: Option<Decimal>,
}

impl From<&ClosedPositionRecord> for CloseNotice {
    fn from(record: &ClosedPositionRecord) -> Self {
        Self {
            symbol: record.symbol.clone(),
            kind: record.kind,
            entry_price: record.entry_price,
            exit_price: record.exit_price,
            pnl_percent: record.pnl_percent,
            pnl_usd: record.pnl_usd,
            reason: record.reason,
            fee: record.fee,
        }
    }
}

/// Receives a message for every committed close.
pub trait NotificationSink: Send + Sync {
    fn position_closed<'a>(&'a self, notice: &'a CloseNotice) -> BoxFuture<'a, PositionResult<()>>;
}

/// Receives the full record of every committed close.
pub trait LedgerSink: Send + Sync {
    fn record_closed_position<'a>(
        &'a self,
        record: &'a ClosedPositionRecord,
    ) -> BoxFuture<'a, PositionResult<()>>;
}

/// In-memory sink recording everything it receives.
#[derive(Debug, Default)]
pub struct MemorySink {
    notices: parking_lot::Mutex<Vec<CloseNotice>>,
    records: parking_lot::Mutex<Vec<ClosedPositionRecord>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail (after recording nothing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn notices(&self) -> Vec<CloseNotice> {
        self.notices.lock().clone()
    }

    pub fn records(&self) -> Vec<ClosedPositionRecord> {
        self.records.lock().clone()
    }
}

impl NotificationSink for MemorySink {
    fn position_closed<'a>(&'a self, notice: &'a CloseNotice) -> BoxFuture<'a, PositionResult<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PositionError::Notification("sink offline".to_string()));
            }
            self.notices.lock().push(notice.clone());
            Ok(())
        })
    }
}

impl LedgerSink for MemorySink {
    fn record_closed_position<'a>(
        &'a self,
        record: &'a ClosedPositionRecord,
    ) -> BoxFuture<'a, PositionResult<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PositionError::Ledger("sink offline".to_string()));
            }
            self.records.lock().push(record.clone());
            Ok(())
        })
    }
}
