//! Precision-safe decimal types for position accounting.
//!
//! Uses `rust_decimal` for exact decimal arithmetic so that PnL thresholds
//! compare exactly (a 50.00% move is never evaluated as 49.999...%).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use crate::error::CoreError;

/// Price with exact decimal precision.
///
/// Wraps `Decimal` to keep prices and sizes from being mixed up in
/// PnL calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

impl Price {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Validate that this price can be used in a PnL calculation.
    ///
    /// Zero and negative prices come from broken ticker payloads and must
    /// never drive a close decision.
    pub fn validated(self) -> Result<Self, CoreError> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(CoreError::InvalidPrice(self.0.to_string()))
        }
    }

    /// Percentage change of `self` relative to `base`.
    ///
    /// Returns `None` if `base` is zero.
    #[inline]
    pub fn pct_from(&self, base: Price) -> Option<Decimal> {
        if base.is_zero() {
            return None;
        }
        Some((self.0 - base.0) / base.0 * Decimal::ONE_HUNDRED)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Price {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Sub for Price {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// Size/quantity with exact decimal precision.
///
/// Used for position amounts, exchange balances and flatten order sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Size(pub Decimal);

impl Size {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Absolute value. Contract positions may be reported signed.
    #[inline]
    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// Round down to lot size.
    #[inline]
    pub fn round_to_lot(&self, lot_size: Size) -> Self {
        if lot_size.is_zero() {
            return *self;
        }
        Self((self.0 / lot_size.0).floor() * lot_size.0)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Size {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Size {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Size {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Size {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_pct_from() {
        let entry = Price::new(dec!(100));
        let now = Price::new(dec!(120));

        assert_eq!(now.pct_from(entry), Some(dec!(20)));
        assert_eq!(now.pct_from(Price::ZERO), None);
    }

    #[test]
    fn test_price_validated_rejects_non_positive() {
        assert!(Price::new(dec!(0)).validated().is_err());
        assert!(Price::new(dec!(-1)).validated().is_err());
        assert_eq!(
            Price::new(dec!(0.5)).validated().unwrap(),
            Price::new(dec!(0.5))
        );
    }

    #[test]
    fn test_size_round_to_lot() {
        let size = Size::new(dec!(1.2345678));
        let lot = Size::new(dec!(0.000001));

        assert_eq!(size.round_to_lot(lot).0, dec!(1.234567));
        assert_eq!(size.round_to_lot(Size::ZERO), size);
    }

    #[test]
    fn test_size_round_to_lot_below_one_lot_is_zero() {
        let dust = Size::new(dec!(0.0004));
        assert!(dust.round_to_lot(Size::new(dec!(0.001))).is_zero());
    }
}
