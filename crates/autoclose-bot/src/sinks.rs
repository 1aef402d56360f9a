//! Sink implementations: log-based notifier and JSON-lines ledger.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use autoclose_core::CloseReason;
use autoclose_persistence::{ClosedPositionRecord, JsonLinesLedger};
use autoclose_position::{
    BoxFuture, CloseNotice, LedgerSink, NotificationSink, PositionError, PositionResult,
};

use crate::error::AppResult;

/// Maximum message length accepted by chat transports.
pub const MAX_MESSAGE_CHARS: usize = 4096;

fn reason_text(reason: Option<CloseReason>) -> &'static str {
    match reason {
        Some(CloseReason::Timeout) => "hold time expired",
        Some(CloseReason::Target) => "profit target reached",
        Some(CloseReason::Liquidation) => "liquidated",
        None => "position closed",
    }
}

/// Render the human-facing close message, capped at [`MAX_MESSAGE_CHARS`].
pub fn format_close_message(notice: &CloseNotice) -> String {
    let mut text = format!(
        "{symbol} ({kind}) closed: {reason}\n\
         entry {entry} -> exit {exit}\n\
         PnL {pct:.2}% ({usd:.2} USD)",
        symbol = notice.symbol,
        kind = notice.kind,
        reason = reason_text(notice.reason),
        entry = notice.entry_price,
        exit = notice.exit_price,
        pct = notice.pnl_percent,
        usd = notice.pnl_usd,
    );
    if let Some(fee) = notice.fee {
        text.push_str(&format!("\nfee {fee:.4}"));
    }

    if text.chars().count() > MAX_MESSAGE_CHARS {
        warn!(symbol = %notice.symbol, "Close message truncated");
        text = text.chars().take(MAX_MESSAGE_CHARS).collect();
    }
    text
}

/// Emits close messages through `tracing`.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl NotificationSink for LogNotifier {
    fn position_closed<'a>(&'a self, notice: &'a CloseNotice) -> BoxFuture<'a, PositionResult<()>> {
        Box::pin(async move {
            let message = format_close_message(notice);
            info!(
                target: "autoclose::notify",
                symbol = %notice.symbol,
                reason = reason_text(notice.reason),
                message = %message,
                "Position closed"
            );
            Ok(())
        })
    }
}

/// [`LedgerSink`] backed by daily JSON-lines files.
///
/// Appends run on the blocking pool; the caller holds the symbol's close
/// lock while it waits.
pub struct JsonLinesSink {
    ledger: Arc<Mutex<JsonLinesLedger>>,
}

impl JsonLinesSink {
    pub fn new(dir: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self {
            ledger: Arc::new(Mutex::new(JsonLinesLedger::new(dir)?)),
        })
    }
}

impl LedgerSink for JsonLinesSink {
    fn record_closed_position<'a>(
        &'a self,
        record: &'a ClosedPositionRecord,
    ) -> BoxFuture<'a, PositionResult<()>> {
        let ledger = Arc::clone(&self.ledger);
        let record = record.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || ledger.lock().append(&record))
                .await
                .map_err(|e| PositionError::Ledger(format!("ledger task failed: {e}")))?
                .map_err(|e| PositionError::Ledger(e.to_string()))
        })
    }
}
