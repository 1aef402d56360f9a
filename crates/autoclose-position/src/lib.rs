//! Position lifecycle and close engine.
//!
//! Decides when an open position must be closed (profit target, hold-time
//! expiry, forced liquidation) and closes it exactly once.
//!
//! # Key Components
//!
//! - [`PositionMonitor`]: per-symbol close state machine, timers and checks
//! - [`LiquidationReconciler`]: folds exchange liquidations into local state
//! - [`ExchangeGateway`]: everything the engine needs from the venue
//! - [`PaperExchange`]: in-memory gateway for tests and dry runs
//! - [`HoldTimer`]: hold-time policy and restore math
//! - [`plan_flatten`]: reduce-order sizing with lot rounding
//! - [`NotificationSink`] / [`LedgerSink`]: outbound close records

pub mod error;
pub mod flatten;
pub mod gateway;
pub mod liquidation;
pub mod monitor;
pub mod paper;
pub mod pnl;
pub mod sink;
pub mod timer;

pub use error::{GatewayError, MonitorError, MonitorResult, PositionError, PositionResult};
pub use flatten::{plan_flatten, FlattenPlan, FlattenRequest};
pub use gateway::{
    BoxFuture, ContractPosition, DynGateway, ExchangeGateway, GatewayResult, LiquidationEvent,
    OrderAck, PnlSnapshot, DEFAULT_LOT_SIZE,
};
pub use liquidation::{LiquidationCheck, LiquidationConfig, LiquidationReconciler, LiquidationSummary};
pub use monitor::{
    CheckOutcome, CloseOutcome, CloseStage, KnownExit, MonitorConfig, PositionMonitor,
    RestoreReport, SkipReason, SweepReport, SymbolState,
};
pub use paper::PaperExchange;
pub use pnl::{fallback_realized, realized_pnl_usd, unrealized_pnl_pct};
pub use sink::{CloseNotice, LedgerSink, MemorySink, NotificationSink};
pub use timer::{spawn_expiry, HoldTimer, DEFAULT_HOLD};
