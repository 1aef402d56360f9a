//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] autoclose_persistence::PersistenceError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] autoclose_position::MonitorError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] autoclose_telemetry::TelemetryError),

    #[error("Invalid input: {0}")]
    Input(#[from] autoclose_core::CoreError),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
