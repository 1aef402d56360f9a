//! Error types for autoclose-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Unknown position kind: {0}")]
    UnknownPositionKind(String),

    #[error("Unknown close reason: {0}")]
    UnknownCloseReason(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
