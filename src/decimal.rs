// =============================================================================
// Decimal — fixed-precision money type
// =============================================================================
//
// All monetary quantities in the connector are `Decimal`. Binary floating
// point never appears on a money path; the one permitted use of `f64` is
// display-only formatting an embedder may do on its own side of the
// boundary, which is out of this crate's reach entirely.
//
// `rust_decimal::Decimal` is a fixed 96-bit decimal (28-29 significant
// digits, not configurable) rather than a true arbitrary-precision type —
// no exchange's price/quantity/notional range needs more, and it keeps
// `Decimal` `Copy` the way the rest of this crate relies on.
// =============================================================================

use std::str::FromStr;

pub use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;

use crate::error::ConnectorError;

/// Parse a decimal from exchange wire text. This is the only safe path for
/// untrusted input — never construct a `Decimal` from an `f64` you received
/// over the wire.
pub fn parse(value: &str) -> crate::error::Result<Decimal> {
    Decimal::from_str(value).map_err(|e| ConnectorError::Validation {
        field: "decimal".to_string(),
        value: value.to_string(),
        constraint: format!("not a valid decimal literal: {e}"),
    })
}

/// Parse a constant decimal literal, panicking on failure. Intended for
/// compile-time-known constants (symbol tick sizes, test fixtures), never
/// for exchange-supplied input.
pub fn dec(literal: &str) -> Decimal {
    Decimal::from_str(literal).unwrap_or_else(|e| panic!("invalid decimal literal {literal:?}: {e}"))
}

/// Round-half-to-even division at the given scale (banker's rounding),
/// the default rounding mode for quantity and notional calculations.
pub fn div_round_half_even(numerator: Decimal, denominator: Decimal, scale: u32) -> Decimal {
    (numerator / denominator).round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("not-a-number").is_err());
    }

    #[test]
    fn parse_accepts_exchange_strings() {
        assert_eq!(parse("12345.6789").unwrap(), dec("12345.6789"));
    }

    #[test]
    fn division_rounds_half_to_even() {
        let a = dec("1");
        let b = dec("8");
        // 0.125 rounded to 2dp half-to-even -> 0.12
        assert_eq!(div_round_half_even(a, b, 2), dec("0.12"));
    }

    #[test]
    fn ordering_is_value_based() {
        assert!(dec("1.50") == dec("1.5"));
        assert!(dec("2") > dec("1.999"));
    }
}
