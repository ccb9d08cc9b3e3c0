//! Monetary tolerances and rounding.
//!
//! All amounts are `rust_decimal::Decimal` with two fractional digits in
//! storage. Comparisons that decide "is anything left" go through the
//! tolerances below instead of exact equality.

use rust_decimal::{Decimal, RoundingStrategy};

/// Amounts at or below this are treated as nothing left to allocate (0.01).
pub const ALLOCATION_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Tolerance used when deciding whether an invoice is fully paid (0.001).
pub const STATUS_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// Number of fractional digits kept for money.
pub const MONEY_SCALE: u32 = 2;

/// Round to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Whether `amount` has no digits below a cent. Trailing zeros don't count.
pub fn is_whole_cents(amount: Decimal) -> bool {
    round_money(amount) == amount
}

/// Whether `amount` is too small to be worth allocating.
pub fn is_negligible(amount: Decimal) -> bool {
    amount <= ALLOCATION_TOLERANCE
}

/// Whether two amounts are equal within [`STATUS_TOLERANCE`].
pub fn approx_eq(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= STATUS_TOLERANCE
}

/// Clamp negative values to zero.
pub fn non_negative(amount: Decimal) -> Decimal {
    amount.max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn tolerances_have_expected_values() {
        assert_eq!(ALLOCATION_TOLERANCE, dec!(0.01));
        assert_eq!(STATUS_TOLERANCE, dec!(0.001));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(10.005)), dec!(10.01));
        assert_eq!(round_money(dec!(10.004)), dec!(10.00));
        assert_eq!(round_money(dec!(-10.005)), dec!(-10.01));
        assert_eq!(round_money(dec!(33.333333)), dec!(33.33));
    }

    #[test]
    fn whole_cents_ignore_trailing_zeros() {
        assert!(is_whole_cents(dec!(10)));
        assert!(is_whole_cents(dec!(10.50)));
        assert!(is_whole_cents(dec!(10.500)));
        assert!(!is_whole_cents(dec!(10.005)));
        assert!(!is_whole_cents(dec!(0.001)));
    }

    #[test]
    fn negligible_threshold_is_inclusive() {
        assert!(is_negligible(dec!(0.01)));
        assert!(is_negligible(dec!(0)));
        assert!(is_negligible(dec!(-5)));
        assert!(!is_negligible(dec!(0.02)));
    }

    #[test]
    fn approx_eq_uses_status_tolerance() {
        assert!(approx_eq(dec!(100.00), dec!(100.001)));
        assert!(!approx_eq(dec!(100.00), dec!(100.01)));
        assert_eq!(non_negative(dec!(-0.5)), Decimal::ZERO);
    }
}
