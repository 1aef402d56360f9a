//! Position auto-close service.
//!
//! Wires the close engine to its stores and sinks:
//! - Startup recovery of persisted hold timers
//! - Periodic sweep of every open position
//! - Forced-liquidation polling
//! - Graceful shutdown that keeps timer rows for the next start

pub mod app;
pub mod config;
pub mod error;
pub mod sinks;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use sinks::{format_close_message, JsonLinesSink, LogNotifier};
