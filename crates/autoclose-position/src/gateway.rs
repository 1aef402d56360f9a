//! Exchange gateway trait.
//!
//! The engine never speaks an exchange wire protocol. Everything it needs
//! from the venue goes through `ExchangeGateway`, which allows for:
//! - Unit testing with the in-memory `PaperExchange`
//! - Swapping venues without touching the close state machine

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use autoclose_core::{OrderSide, Price, Size, Symbol};

use crate::error::GatewayError;
use crate::flatten::FlattenRequest;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Default lot size: six decimal places.
pub const DEFAULT_LOT_SIZE: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Open contract position as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractPosition {
    /// Absolute size. Zero when there is no position.
    pub size: Size,
    pub side: OrderSide,
}

impl ContractPosition {
    #[must_use]
    pub fn flat(side: OrderSide) -> Self {
        Self {
            size: Size::ZERO,
            side,
        }
    }
}

/// PnL figures reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub pnl_usd: Decimal,
    /// Percent, already scaled by leverage where the venue does so.
    pub pnl_percent: Decimal,
    #[serde(default)]
    pub fee: Option<Decimal>,
    #[serde(default)]
    pub exit_price: Option<Price>,
}

/// Forced liquidation reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    /// Instrument id as reported (e.g. `BTC-USDT-SWAP`).
    pub instrument: String,
    /// Event time, Unix milliseconds.
    pub timestamp_ms: i64,
    pub exit_price: Price,
    pub pnl_usd: Decimal,
    /// Realized PnL as a fraction (`-0.85` for -85%).
    pub pnl_ratio: Decimal,
    #[serde(default)]
    pub fee: Option<Decimal>,
    /// Size closed by the liquidation, when reported.
    #[serde(default)]
    pub size: Option<Size>,
}

impl LiquidationEvent {
    /// De-duplication key: `instrument:timestamp`.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.instrument, self.timestamp_ms)
    }

    /// Realized PnL in percent.
    #[must_use]
    pub fn pnl_percent(&self) -> Decimal {
        self.pnl_ratio * Decimal::ONE_HUNDRED
    }

    /// The instrument as a `Symbol`, or why the event is unusable.
    pub fn validated_symbol(&self) -> Result<Symbol, String> {
        if self.timestamp_ms <= 0 {
            return Err(format!("non-positive timestamp {}", self.timestamp_ms));
        }
        if !self.exit_price.is_positive() {
            return Err(format!("non-positive exit price {}", self.exit_price));
        }
        Symbol::new(self.instrument.as_str()).map_err(|e| e.to_string())
    }
}

/// Acknowledgement of an accepted reduce order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
}

/// Trait for the exchange operations the close engine consumes.
///
/// Implementations must be cheap to share (`Arc<dyn ExchangeGateway>`) and
/// must not retry internally; the monitor owns timeouts and retries.
pub trait ExchangeGateway: Send + Sync {
    /// Last traded price.
    fn get_price<'a>(&'a self, symbol: &'a Symbol) -> BoxFuture<'a, GatewayResult<Price>>;

    /// Spot balance of `currency`.
    fn get_balance<'a>(&'a self, currency: &'a str) -> BoxFuture<'a, GatewayResult<Size>>;

    /// Open contract position for `symbol`.
    fn get_contract_position<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> BoxFuture<'a, GatewayResult<ContractPosition>>;

    /// Submit a reduce-only market order.
    fn place_reduce_order<'a>(
        &'a self,
        request: &'a FlattenRequest,
    ) -> BoxFuture<'a, GatewayResult<OrderAck>>;

    /// Realized PnL of the most recent close on `symbol`.
    fn get_realized_pnl<'a>(&'a self, symbol: &'a Symbol)
        -> BoxFuture<'a, GatewayResult<PnlSnapshot>>;

    /// Live unrealized PnL of the open position on `symbol`.
    fn get_unrealized_pnl<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> BoxFuture<'a, GatewayResult<PnlSnapshot>>;

    /// Forced liquidations within the last `window`.
    fn get_forced_liquidations(
        &self,
        window: Duration,
    ) -> BoxFuture<'_, GatewayResult<Vec<LiquidationEvent>>>;

    /// Minimum order increment for `symbol`.
    fn get_lot_size<'a>(&'a self, _symbol: &'a Symbol) -> BoxFuture<'a, GatewayResult<Size>> {
        Box::pin(async { Ok(Size::new(DEFAULT_LOT_SIZE)) })
    }
}

/// Arc wrapper for ExchangeGateway trait objects.
pub type DynGateway = Arc<dyn ExchangeGateway>;
