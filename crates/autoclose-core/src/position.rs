//! Position lifecycle enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::order::OrderSide;

/// Kind of position tracked by the engine.
///
/// A symbol may carry at most one open position of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionKind {
    /// Unleveraged long-style spot holding.
    Directional,
    /// Margined short whose PnL scales with leverage.
    LeveragedShort,
}

impl PositionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directional => "directional",
            Self::LeveragedShort => "leveraged_short",
        }
    }

    /// Side the position was opened with.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Self::Directional => OrderSide::Buy,
            Self::LeveragedShort => OrderSide::Sell,
        }
    }

    /// Side of the reduce order that flattens this position.
    pub fn close_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }
}

impl fmt::Display for PositionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directional" | "spot" => Ok(Self::Directional),
            "leveraged_short" | "short" => Ok(Self::LeveragedShort),
            other => Err(CoreError::UnknownPositionKind(other.to_string())),
        }
    }
}

/// Why a position was closed.
///
/// Persisted rows carry `Option<CloseReason>`; `None` means the position is
/// open or was closed out-of-band without a recorded reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Hold timer expired.
    Timeout,
    /// Profit target reached and confirmed.
    Target,
    /// Exchange force-liquidated the position.
    Liquidation,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Target => "target",
            Self::Liquidation => "liquidation",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(Self::Timeout),
            "target" => Ok(Self::Target),
            "liquidation" => Ok(Self::Liquidation),
            other => Err(CoreError::UnknownCloseReason(other.to_string())),
        }
    }
}
