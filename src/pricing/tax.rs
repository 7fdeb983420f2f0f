//! Tax computation on discounted base prices.
//!
//! All money math uses [`Decimal`]; floats never touch an amount. Tax is
//! rounded half-away-from-zero to two decimal places, matching how the
//! backend recomputes amounts during verification.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Computes the tax amount on a base price.
///
/// Returns `round(base * percentage / 100, 2)` using half-away-from-zero
/// rounding. A zero base or zero percentage yields zero tax.
///
/// # Errors
///
/// Returns [`EngineError::InvalidInput`] if either argument is negative or
/// the multiplication overflows.
pub fn compute_tax(base: Decimal, percentage: Decimal) -> Result<Decimal> {
    if base.is_sign_negative() {
        return Err(EngineError::InvalidInput(format!(
            "tax base cannot be negative, got {base}"
        )));
    }
    if percentage.is_sign_negative() {
        return Err(EngineError::InvalidInput(format!(
            "tax percentage cannot be negative, got {percentage}"
        )));
    }

    let raw = base
        .checked_mul(percentage)
        .and_then(|product| product.checked_div(Decimal::from(100)))
        .ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "tax computation overflowed for base {base} at {percentage}%"
            ))
        })?;

    Ok(raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// A priced-out tax line.
///
/// Carries everything the verifier needs to cross-check an amount: the
/// percentage applied, the resulting tax, and the final payable total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    /// Tax percentage that was applied.
    pub percentage: Decimal,

    /// Tax amount, rounded to two decimal places.
    pub amount: Decimal,

    /// Final payable amount: base plus tax.
    pub total: Decimal,
}

impl TaxBreakdown {
    /// Prices out a base amount at the given tax percentage.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] on negative inputs or
    /// arithmetic overflow.
    pub fn compute(base: Decimal, percentage: Decimal) -> Result<Self> {
        let amount = compute_tax(base, percentage)?;
        let total = base.checked_add(amount).ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "final amount overflowed for base {base} plus tax {amount}"
            ))
        })?;

        Ok(Self {
            percentage,
            amount,
            total,
        })
    }

    /// A zero-tax breakdown for a free amount.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            percentage: Decimal::ZERO,
            amount: Decimal::ZERO,
            total: Decimal::ZERO,
        }
    }
}
