//! PnL math.

use rust_decimal::Decimal;

use autoclose_core::{PositionKind, Price, Size};

/// Unrealized PnL in percent at `price`.
///
/// - directional: `(price - entry) / entry * 100`
/// - leveraged short: `(entry - price) / entry * 100 * leverage`
///
/// Returns `None` if `entry` is zero.
#[must_use]
pub fn unrealized_pnl_pct(
    kind: PositionKind,
    entry: Price,
    price: Price,
    leverage: Decimal,
) -> Option<Decimal> {
    let move_pct = price.pct_from(entry)?;
    Some(match kind {
        PositionKind::Directional => move_pct,
        PositionKind::LeveragedShort => -move_pct * leverage,
    })
}

/// Realized PnL in quote currency: `(exit - entry) * amount`, sign-flipped
/// for shorts.
#[must_use]
pub fn realized_pnl_usd(kind: PositionKind, entry: Price, exit: Price, amount: Size) -> Decimal {
    let diff = (exit - entry).inner() * amount.abs().inner();
    match kind {
        PositionKind::Directional => diff,
        PositionKind::LeveragedShort => -diff,
    }
}

/// Locally computed `(pnl_usd, pnl_percent)` for when the exchange has no
/// realized figures.
#[must_use]
pub fn fallback_realized(
    kind: PositionKind,
    entry: Price,
    exit: Price,
    amount: Size,
    leverage: Decimal,
) -> (Decimal, Decimal) {
    let usd = realized_pnl_usd(kind, entry, exit, amount);
    let pct = unrealized_pnl_pct(kind, entry, exit, leverage).unwrap_or(Decimal::ZERO);
    (usd, pct)
}
