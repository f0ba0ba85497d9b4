//! Arbitrary-precision minor-unit amounts.
//!
//! SQLite has no native bignum column, so every ledger quantity is stored
//! as TEXT holding the base-10 form of a `BigInt` and parsed back on read.

use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use std::str::FromStr;

pub type Amount = BigInt;

pub fn to_db(amount: &Amount) -> String {
    amount.to_string()
}

pub fn from_db(raw: &str) -> anyhow::Result<Amount> {
    BigInt::from_str(raw).map_err(|e| anyhow::anyhow!("invalid stored amount {raw:?}: {e}"))
}

pub fn zero() -> Amount {
    BigInt::zero()
}

/// Half-away-from-zero rounding of `numerator / denominator`, both signed.
pub fn round_half_away_from_zero(numerator: &BigInt, denominator: &BigInt) -> BigInt {
    if denominator.is_zero() || numerator.is_zero() {
        return BigInt::zero();
    }
    let negative = (numerator.sign() == num_bigint::Sign::Minus)
        != (denominator.sign() == num_bigint::Sign::Minus);
    let n = numerator.magnitude();
    let d = denominator.magnitude();
    let quotient = n / d;
    let remainder = n % d;
    let rounded = if &remainder * BigUint::from(2u8) >= *d {
        quotient + BigUint::from(1u8)
    } else {
        quotient
    };
    let rounded = BigInt::from(rounded);
    if negative {
        -rounded
    } else {
        rounded
    }
}

/// Parses a decimal literal like `"1.5"`, `"-0.25"`, or `"3"` into an exact
/// `numerator / denominator` pair, avoiding the float imprecision a JSON
/// `Number` round-trips through `f64` would introduce for program configs.
pub fn parse_decimal(s: &str) -> anyhow::Result<(BigInt, BigInt)> {
    let s = s.trim();
    match s.split_once('.') {
        None => Ok((BigInt::from_str(s)?, BigInt::from(1))),
        Some((whole, frac)) => {
            let denom = BigInt::from(10u64).pow(frac.len() as u32);
            let negative = whole.starts_with('-');
            let whole_digits = whole.trim_start_matches('-');
            let combined = format!("{whole_digits}{frac}");
            let magnitude = BigInt::from_str(if combined.is_empty() { "0" } else { &combined })?;
            let numerator = if negative { -magnitude } else { magnitude };
            Ok((numerator, denom))
        }
    }
}

/// Reads a JSON number as an exact fraction via its textual form.
pub fn json_number_to_fraction(n: &serde_json::Number) -> anyhow::Result<(BigInt, BigInt)> {
    parse_decimal(&n.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_db_string() {
        let a = BigInt::from(-4200);
        assert_eq!(from_db(&to_db(&a)).unwrap(), a);
    }

    #[test]
    fn half_away_from_zero_basic() {
        // 42.5 cents * 1.0 multiplier -> 4250 / 100 = 42.5 -> 43 (grand_total in cents, points = cents/100 * multiplier... see plugins)
        let n = BigInt::from(5);
        let d = BigInt::from(2);
        assert_eq!(round_half_away_from_zero(&n, &d), BigInt::from(3));

        let n = BigInt::from(-5);
        assert_eq!(round_half_away_from_zero(&n, &d), BigInt::from(-3));
    }

    #[test]
    fn parse_decimal_exact() {
        assert_eq!(parse_decimal("1.5").unwrap(), (BigInt::from(15), BigInt::from(10)));
        assert_eq!(parse_decimal("-0.25").unwrap(), (BigInt::from(-25), BigInt::from(100)));
        assert_eq!(parse_decimal("3").unwrap(), (BigInt::from(3), BigInt::from(1)));
    }

    #[test]
    fn default_earn_style_rounding() {
        // grand_total_cents = 4250 (= 42.50), multiplier = 1 -> points = round(42.5) = 43
        let (mult_n, mult_d) = parse_decimal("1").unwrap();
        let numerator = BigInt::from(4250) * mult_n;
        let denominator = BigInt::from(100) * mult_d;
        assert_eq!(round_half_away_from_zero(&numerator, &denominator), BigInt::from(43));
    }
}
