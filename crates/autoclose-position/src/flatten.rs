//! Flatten (reduce order) sizing.
//!
//! Turns the size the exchange reports into the reduce order that closes the
//! position, or decides that the position is already flat.

use std::fmt;

use autoclose_core::{ClientOrderId, OrderSide, PositionKind, Size, Symbol};

/// Reduce-only order that closes a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenRequest {
    pub symbol: Symbol,
    /// Opposite of the position side.
    pub side: OrderSide,
    /// Exchange-reported size rounded down to the lot size.
    pub size: Size,
    pub cloid: ClientOrderId,
}

/// What the close path should do about the exchange-side position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlattenPlan {
    /// Send this reduce order.
    Submit(FlattenRequest),
    /// Nothing left to sell; skip the order and reconcile.
    AlreadyFlat {
        /// Size reported before lot rounding (dust may be non-zero).
        reported: Size,
    },
}

impl FlattenPlan {
    #[must_use]
    pub fn is_flat(&self) -> bool {
        matches!(self, Self::AlreadyFlat { .. })
    }
}

impl fmt::Display for FlattenPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit(req) => write!(f, "Submit({} {})", req.side, req.size),
            Self::AlreadyFlat { reported } => write!(f, "AlreadyFlat(reported={reported})"),
        }
    }
}

/// Plan the flatten for a position of `kind` given the exchange size.
///
/// The size is floored to `lot_size`; anything that rounds to zero counts as
/// already flat so a dust balance never produces a rejected order.
#[must_use]
pub fn plan_flatten(
    symbol: &Symbol,
    kind: PositionKind,
    exchange_size: Size,
    lot_size: Size,
) -> FlattenPlan {
    let size = exchange_size.abs().round_to_lot(lot_size);
    if !size.is_positive() {
        tracing::debug!(
            symbol = %symbol,
            reported = %exchange_size,
            "Exchange size rounds to zero, position already flat"
        );
        return FlattenPlan::AlreadyFlat {
            reported: exchange_size,
        };
    }

    FlattenPlan::Submit(FlattenRequest {
        symbol: symbol.clone(),
        side: kind.close_side(),
        size,
        cloid: ClientOrderId::new(),
    })
}
