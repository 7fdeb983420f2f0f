//! Price composition: coupons first, then tax.
//!
//! The pricing pipeline is deterministic and pure: given a base price, an
//! optional coupon and a tax percentage, the payable total is
//! `tax_total(discount(base))`. The same pipeline runs in the checkout
//! orchestrator and, independently, on the backend during verification.

pub mod coupon;
pub mod tax;

pub use coupon::{
    Coupon, CouponEngine, CouponRedemption, CouponStore, DiscountType, InMemoryCouponStore,
};
pub use tax::{TaxBreakdown, compute_tax};

#[cfg(test)]
mod tests;
