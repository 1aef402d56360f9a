//! Prometheus metrics and structured logging for the auto-close engine.
//!
//! - Structured logging with tracing (JSON in production, pretty otherwise)
//! - Prometheus counters for close outcomes, liquidations and price checks
//! - Periodic statistics summary written to the log

pub mod error;
pub mod logging;
pub mod metrics;
pub mod stats;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
pub use stats::{LatencyStats, StatsReporter, StatsSnapshot};
