//! Persistence error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Position already open: {symbol} ({kind})")]
    AlreadyOpen { symbol: String, kind: String },

    #[error("Store worker '{0}' is not running")]
    WorkerClosed(String),

    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
