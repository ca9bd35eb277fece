//! Decimal type utilities for precise financial calculations

use std::str::FromStr;

pub use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
pub use rust_decimal_macros::dec;

use crate::error::{Error, Result};

/// Price type with high precision
pub type Price = Decimal;

/// Quantity type with high precision
pub type Quantity = Decimal;

/// Amount type with high precision (typically Price * Quantity)
pub type Amount = Decimal;

/// Precision helpers for common operations
pub mod precision {
    use super::*;

    /// Default price precision (8 decimal places)
    pub const PRICE_PRECISION: u32 = 8;

    /// Round price to standard precision
    pub fn round_price(price: Price) -> Price {
        price.round_dp(PRICE_PRECISION)
    }

    /// Quantize an amount to `scale` decimal places, rounding toward zero
    pub fn quantize_down(value: Decimal, scale: u32) -> Decimal {
        value.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
    }
}

/// Parse a client-supplied decimal string.
///
/// Only ASCII digits and at most one dot are accepted: no sign, exponent,
/// whitespace or thousands separators.
pub fn parse_strict(input: &str) -> Result<Decimal> {
    let mut dots = 0;
    let mut digits = 0;
    for c in input.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return Err(Error::InvalidInput(format!("Invalid number: {}", input))),
        }
    }
    if digits == 0 || dots > 1 {
        return Err(Error::InvalidInput(format!("Invalid number: {}", input)));
    }
    if input.starts_with('.') {
        return Decimal::from_str(&format!("0{}", input)).map_err(Error::from);
    }
    Decimal::from_str(input).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parse_accepts_plain_decimals() {
        assert_eq!(parse_strict("10").unwrap(), dec!(10));
        assert_eq!(parse_strict("0.5").unwrap(), dec!(0.5));
        assert_eq!(parse_strict(".5").unwrap(), dec!(0.5));
    }

    #[test]
    fn strict_parse_rejects_everything_else() {
        for bad in ["", ".", "1.2.3", "-1", "1e5", " 1", "1,000", "+2"] {
            assert!(parse_strict(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn quantize_rounds_toward_zero() {
        assert_eq!(precision::quantize_down(dec!(0.123456789), 8), dec!(0.12345678));
        assert_eq!(precision::quantize_down(dec!(1.999), 2), dec!(1.99));
    }
}
