//! Numeric value recognition and conversion.
//!
//! A value is numeric when, after removing one leading or trailing currency
//! symbol, it is an optionally signed run of digits (optionally grouped by
//! commas in thousands), with an optional decimal fraction and an optional
//! trailing percent sign.

use std::{str::FromStr, sync::LazyLock};

use regex::Regex;
use rust_decimal::{Decimal, prelude::ToPrimitive};

use crate::{
    error::{IngestError, Result},
    model::ColumnType,
};

pub const DECIMAL_PLACES: u32 = 7;

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹', '₩', '₽', '₺', '₪', '₫', '¢'];

static NUMERIC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d{1,3}(?:,\d{3})+|\d+)?(?:\.\d+)?%?$").expect("numeric pattern compiles")
});

/// Removes a single currency symbol from either end, keeping any sign in front.
fn strip_currency(value: &str) -> &str {
    let trimmed = value.trim();
    if let Some(rest) = trimmed.strip_prefix(CURRENCY_SYMBOLS) {
        return rest.trim_start();
    }
    if let Some(rest) = trimmed.strip_suffix(CURRENCY_SYMBOLS) {
        return rest.trim_end();
    }
    trimmed
}

/// Returns the body without the currency symbol when it matches the numeric pattern.
fn numeric_body(value: &str) -> Option<String> {
    let stripped = strip_currency(value);
    let mut body = stripped.to_string();
    // "-$12.00" and "+€3" keep the sign before the symbol.
    if let Some(sign) = stripped.chars().next().filter(|c| matches!(c, '+' | '-')) {
        let rest = strip_currency(&stripped[1..]);
        if rest.len() != stripped.len() - 1 {
            body = format!("{sign}{rest}");
        }
    }
    if !body.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    NUMERIC_PATTERN.is_match(&body).then_some(body)
}

/// True exactly when [`to_number`] would convert the value.
pub fn is_numeric(value: &str) -> bool {
    to_number(value).is_ok()
}

/// Converts a numeric string to `f64`, rounded to seven decimal places.
pub fn to_number(value: &str) -> Result<f64> {
    let format_error = || IngestError::Format {
        value: value.to_string(),
        target: ColumnType::Number,
    };
    let body = numeric_body(value).ok_or_else(format_error)?;
    let (digits, percent) = match body.strip_suffix('%') {
        Some(rest) => (rest, true),
        None => (body.as_str(), false),
    };
    let cleaned: String = digits.chars().filter(|c| *c != ',').collect();
    let cleaned = match cleaned.strip_prefix('+') {
        Some(rest) => rest.to_string(),
        None => cleaned,
    };
    let cleaned = if cleaned.starts_with('.') || cleaned.starts_with("-.") {
        cleaned.replacen('.', "0.", 1)
    } else {
        cleaned
    };
    let Ok(mut decimal) = Decimal::from_str(&cleaned) else {
        return wide_number(&cleaned, percent).ok_or_else(format_error);
    };
    if percent {
        decimal /= Decimal::ONE_HUNDRED;
    }
    decimal
        .round_dp(DECIMAL_PLACES)
        .to_f64()
        .ok_or_else(format_error)
}

/// Magnitudes past `Decimal`'s 96-bit range go through `f64` directly.
fn wide_number(cleaned: &str, percent: bool) -> Option<f64> {
    let mut value: f64 = cleaned.parse().ok()?;
    if percent {
        value /= 100.0;
    }
    value.is_finite().then(|| round_number(value))
}

/// Rounds a float to the same precision conversions produce.
pub fn round_number(value: f64) -> f64 {
    let factor = 10f64.powi(DECIMAL_PLACES as i32);
    let scaled = value * factor;
    if scaled.is_finite() {
        scaled.round() / factor
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_grouped_signed_and_percent_values() {
        for value in ["1", "-12", "+3.5", "1,234", "1,234,567.89", ".5", "45%", "-0.25%"] {
            assert!(is_numeric(value), "{value} should be numeric");
        }
    }

    #[test]
    fn rejects_malformed_grouping_and_text() {
        for value in ["12,34", "1,2345", "abc", "", "-", "%", "1.2.3", "1e5", "12 34"] {
            assert!(!is_numeric(value), "{value} should not be numeric");
        }
    }

    #[test]
    fn currency_symbols_are_stripped_from_either_end() {
        assert!(is_numeric("$1,200.50"));
        assert!(is_numeric("12.00 €"));
        assert!(is_numeric("-$5"));
        assert!(!is_numeric("$"));
        assert!(!is_numeric("$$5"));
    }

    #[test]
    fn conversion_handles_percent_and_rounding() {
        assert_eq!(to_number("$1,234.50").unwrap(), 1234.5);
        assert_eq!(to_number("45%").unwrap(), 0.45);
        assert_eq!(to_number("-$5").unwrap(), -5.0);
        assert_eq!(to_number(".5").unwrap(), 0.5);
        assert_eq!(to_number("0.123456789").unwrap(), 0.1234568);
    }

    #[test]
    fn long_identifiers_convert_beyond_decimal_range() {
        let value = "123456789012345678901234567890";
        assert!(is_numeric(value));
        let number = to_number(value).unwrap();
        assert!((number - 1.2345678901234568e29).abs() <= 1e14);
        assert_eq!(to_number("-1,000,000,000,000,000,000,000,000,000,000").unwrap(), -1e33);
    }

    #[test]
    fn values_overflowing_f64_are_not_numeric() {
        let huge = "9".repeat(400);
        assert!(!is_numeric(&huge));
        assert!(to_number(&huge).is_err());
    }

    #[test]
    fn conversion_of_text_is_a_format_error() {
        let err = to_number("n/a").unwrap_err();
        assert!(matches!(err, IngestError::Format { target: ColumnType::Number, .. }));
    }
}
