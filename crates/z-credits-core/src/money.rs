//! Fixed-point currency helpers.
//!
//! All money is integer cents (`i64`). Proration is the only place a fraction
//! appears, and it is resolved here, once, with round-half-up.

/// Cents per dollar.
pub const CENTS_PER_DOLLAR: i64 = 100;

/// Scale `price_cents` by `numerator / denominator`, rounding half up.
///
/// Half-up is applied to the magnitude, so negative prices round away from
/// zero symmetrically. Returns `None` when `denominator` is not positive or the
/// result does not fit in `i64`.
#[must_use]
pub fn prorate_cents(price_cents: i64, numerator: i64, denominator: i64) -> Option<i64> {
    if denominator <= 0 {
        return None;
    }

    let product = i128::from(price_cents) * i128::from(numerator);
    let denominator = i128::from(denominator);
    let magnitude = (product.abs() * 2 + denominator) / (denominator * 2);
    let rounded = if product < 0 { -magnitude } else { magnitude };

    i64::try_from(rounded).ok()
}

/// Render cents as a plain dollar amount, e.g. `867` → `"8.67"`.
#[must_use]
pub fn format_usd(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let unit = CENTS_PER_DOLLAR.unsigned_abs();
    format!("{sign}{}.{:02}", abs / unit, abs % unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prorate_rounds_half_up() {
        // 19.00 * 10/30 = 6.333.. -> 6.33
        assert_eq!(prorate_cents(1900, 10, 30), Some(633));
        // 45.00 * 10/30 = 15.00
        assert_eq!(prorate_cents(4500, 10, 30), Some(1500));
        // 0.05 * 1/2 = 0.025 -> 0.03
        assert_eq!(prorate_cents(5, 1, 2), Some(3));
        // 0.01 * 1/3 = 0.0033 -> 0.00
        assert_eq!(prorate_cents(1, 1, 3), Some(0));
    }

    #[test]
    fn prorate_negative_is_symmetric() {
        assert_eq!(prorate_cents(-5, 1, 2), Some(-3));
        assert_eq!(prorate_cents(-1900, 10, 30), Some(-633));
    }

    #[test]
    fn prorate_rejects_empty_denominator() {
        assert_eq!(prorate_cents(1900, 0, 0), None);
        assert_eq!(prorate_cents(1900, 1, -3), None);
    }

    #[test]
    fn prorate_full_and_empty_periods() {
        assert_eq!(prorate_cents(1900, 30, 30), Some(1900));
        assert_eq!(prorate_cents(1900, 0, 30), Some(0));
    }

    #[test]
    fn usd_formatting() {
        assert_eq!(format_usd(867), "8.67");
        assert_eq!(format_usd(-867), "-8.67");
        assert_eq!(format_usd(5), "0.05");
        assert_eq!(format_usd(0), "0.00");
    }
}
