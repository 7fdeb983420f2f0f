use proptest::prelude::*;
use rust_decimal::Decimal;

use crate::pricing::coupon::{Coupon, DiscountType};
use crate::pricing::tax::{TaxBreakdown, compute_tax};

fn coupon(discount_type: DiscountType, value: Decimal) -> Coupon {
    Coupon {
        code: "PROP".to_string(),
        discount_type,
        discount_value: value,
        valid_from: None,
        valid_until: None,
        max_uses: 1,
        used_count: 0,
        applies_to: None,
        active: true,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn test_tax_is_bounded_by_base(
        base_cents in 0i64..=100_000_000i64,
        percentage in 0u32..=100u32,
    ) {
        let base = Decimal::new(base_cents, 2);
        let tax = compute_tax(base, Decimal::from(percentage)).unwrap();

        prop_assert!(!tax.is_sign_negative(), "tax went negative: {tax}");
        prop_assert!(tax <= base, "tax {tax} exceeds base {base}");
    }

    #[test]
    fn test_total_is_base_plus_tax_at_two_places(
        base_cents in 0i64..=100_000_000i64,
        percentage in 0u32..=100u32,
    ) {
        let base = Decimal::new(base_cents, 2);
        let breakdown = TaxBreakdown::compute(base, Decimal::from(percentage)).unwrap();

        prop_assert_eq!(breakdown.total, base + breakdown.amount);
        // Rounding to two places must already have happened.
        prop_assert_eq!(breakdown.amount.round_dp(2), breakdown.amount);
        prop_assert_eq!(breakdown.total.round_dp(2), breakdown.total);
    }

    #[test]
    fn test_percentage_discount_stays_within_bounds(
        base_cents in 0i64..=100_000_000i64,
        percentage in 0u32..=100u32,
    ) {
        let base = Decimal::new(base_cents, 2);
        let coupon = coupon(DiscountType::Percentage, Decimal::from(percentage));
        let discounted = coupon.apply(base).unwrap();

        prop_assert!(!discounted.is_sign_negative());
        prop_assert!(discounted <= base, "discount raised the price: {discounted} > {base}");
    }

    #[test]
    fn test_fixed_discount_stays_within_bounds(
        base_cents in 0i64..=100_000_000i64,
        discount_cents in 0i64..=200_000_000i64,
    ) {
        let base = Decimal::new(base_cents, 2);
        let coupon = coupon(DiscountType::Fixed, Decimal::new(discount_cents, 2));
        let discounted = coupon.apply(base).unwrap();

        prop_assert!(!discounted.is_sign_negative());
        prop_assert!(discounted <= base);
    }

    #[test]
    fn test_discounting_never_raises_the_total(
        base_cents in 0i64..=100_000_000i64,
        discount_percentage in 0u32..=100u32,
        tax_percentage in 0u32..=100u32,
    ) {
        let base = Decimal::new(base_cents, 2);
        let coupon = coupon(DiscountType::Percentage, Decimal::from(discount_percentage));
        let discounted = coupon.apply(base).unwrap();

        let full = TaxBreakdown::compute(base, Decimal::from(tax_percentage)).unwrap();
        let reduced = TaxBreakdown::compute(discounted, Decimal::from(tax_percentage)).unwrap();

        prop_assert!(reduced.total <= full.total);
    }
}
