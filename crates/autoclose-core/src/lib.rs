//! Core domain types for the position auto-close engine.
//!
//! This crate provides fundamental types used throughout the workspace:
//! - `Symbol`: Exchange instrument identifier (e.g. `BTC-USDT`, `BTC-USDT-SWAP`)
//! - `Price`, `Size`: Precision-safe numeric types
//! - `PositionKind`, `CloseReason`: Position lifecycle enums
//! - `OrderSide`, `ClientOrderId`: Order-related types

pub mod decimal;
pub mod error;
pub mod order;
pub mod position;
pub mod symbol;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use order::{ClientOrderId, OrderSide};
pub use position::{CloseReason, PositionKind};
pub use symbol::Symbol;
