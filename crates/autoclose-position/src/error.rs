//! Position error types.

use thiserror::Error;

use autoclose_core::CoreError;
use autoclose_persistence::PersistenceError;

/// Errors reported by an `ExchangeGateway`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Transient connectivity or server-side failure.
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("Exchange call {call} timed out after {timeout_ms}ms")]
    Timeout { call: &'static str, timeout_ms: u64 },

    /// Missing, zero or unparseable price data.
    #[error("Invalid price data: {0}")]
    InvalidPriceData(String),

    /// Nothing left to sell; the position is already flat.
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Order rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Check if the error is worth retrying within the same cycle.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Errors reported by sinks and position bookkeeping.
#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Position not found: {0}")]
    NotFound(String),

    #[error("Invalid position state: {0}")]
    InvalidState(String),

    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Ledger write failed: {0}")]
    Ledger(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type PositionResult<T> = Result<T, PositionError>;

/// Errors escalated out of the monitor and the liquidation reconciler.
///
/// Exchange and sink failures are absorbed at the symbol boundary; only
/// failures of the persisted state reach the caller.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Exchange error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Close task for {0} panicked or was cancelled")]
    TaskFailed(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
