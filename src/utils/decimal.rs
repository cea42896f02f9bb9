//! Decimal arithmetic utilities for trade price calculations.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Option premiums are quoted in cents.
pub const PRICE_TICK: Decimal = dec!(0.01);

/// Round to tick size (e.g., 0.01 for most option premiums).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Signed percent change from `from` to `to`, as f64 (e.g. 100 -> 70 = -30.0).
///
/// Returns `None` when `from` is zero.
pub fn percent_change(from: Decimal, to: Decimal) -> Option<f64> {
    if from == Decimal::ZERO {
        return None;
    }
    ((to - from) / from * dec!(100)).to_f64()
}

/// Lossy conversion for analytics; non-representable values become zero.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Convert an f64 analytic value back to a price, rounded to the tick.
pub fn from_f64_price(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64_retain(value).map(|d| round_to_tick(d, PRICE_TICK))
}
