//! Coupon validation, discount math and redemption accounting.
//!
//! Validation is deliberately forgiving: an unknown, expired, exhausted or
//! mismatched coupon simply means "no discount", and a store failure during
//! lookup degrades the same way. Redemption is the opposite: it re-checks
//! the cap under the store lock and fails hard when the cap is gone, so a
//! coupon can never be oversold by concurrent checkouts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::UserType;
use crate::error::{EngineError, Result};

/// How a coupon's value is applied to a base price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// Value is a percentage taken off the base price.
    Percentage,
    /// Value is a fixed amount subtracted from the base price.
    Fixed,
}

/// A discount coupon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    /// Coupon code as entered by the user.
    pub code: String,

    /// How [`discount_value`](Self::discount_value) is applied.
    pub discount_type: DiscountType,

    /// Percentage (0..=100) or fixed amount, depending on the type.
    pub discount_value: Decimal,

    /// Start of the validity window, if bounded.
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,

    /// End of the validity window, if bounded.
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,

    /// Maximum number of redemptions across all users.
    pub max_uses: u32,

    /// Redemptions recorded so far.
    #[serde(default)]
    pub used_count: u32,

    /// Role this coupon is restricted to, or `None` for any role.
    #[serde(default)]
    pub applies_to: Option<UserType>,

    /// Whether the coupon is currently enabled.
    #[serde(default = "default_coupon_active")]
    pub active: bool,
}

fn default_coupon_active() -> bool {
    true
}

impl Coupon {
    /// Whether the coupon can be redeemed at `now`.
    ///
    /// Checks the active flag, the validity window, and the redemption cap.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        if let Some(from) = self.valid_from
            && now < from
        {
            return false;
        }
        if let Some(until) = self.valid_until
            && now > until
        {
            return false;
        }
        self.used_count < self.max_uses
    }

    /// Whether the coupon may be used by the given role.
    #[must_use]
    pub fn applies_to_role(&self, user_type: UserType) -> bool {
        self.applies_to.is_none_or(|role| role == user_type)
    }

    /// Applies the discount to a base price.
    ///
    /// Percentage coupons scale the base by `(1 - value/100)`; fixed
    /// coupons subtract their value. The result is clamped at zero and
    /// rounded to two decimal places.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if the discount value is
    /// negative, a percentage exceeds 100, or the math overflows.
    pub fn apply(&self, base: Decimal) -> Result<Decimal> {
        if self.discount_value.is_sign_negative() {
            return Err(EngineError::InvalidInput(format!(
                "coupon '{}' has a negative discount value",
                self.code
            )));
        }

        let discounted = match self.discount_type {
            DiscountType::Percentage => {
                if self.discount_value > Decimal::ONE_HUNDRED {
                    return Err(EngineError::InvalidInput(format!(
                        "coupon '{}' discounts more than 100%",
                        self.code
                    )));
                }
                let remaining = Decimal::ONE_HUNDRED - self.discount_value;
                base.checked_mul(remaining)
                    .and_then(|scaled| scaled.checked_div(Decimal::ONE_HUNDRED))
                    .ok_or_else(|| {
                        EngineError::InvalidInput(format!(
                            "discount overflowed for base {base} with coupon '{}'",
                            self.code
                        ))
                    })?
            }
            DiscountType::Fixed => (base - self.discount_value).max(Decimal::ZERO),
        };

        Ok(discounted.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}

/// A recorded coupon redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponRedemption {
    /// Code that was redeemed.
    pub coupon_code: String,

    /// User who redeemed it.
    pub user_id: String,

    /// Subscription the redemption paid for.
    pub subscription_id: String,

    /// When the redemption was recorded.
    pub redeemed_at: DateTime<Utc>,
}

/// Persistence seam for coupons and their redemptions.
#[async_trait]
pub trait CouponStore: Send + Sync + std::fmt::Debug {
    /// Fetches a coupon by code.
    async fn fetch(&self, code: &str) -> Result<Option<Coupon>>;

    /// Records a redemption and increments the coupon's use count.
    ///
    /// The cap must be re-checked and the count incremented under one
    /// critical section so concurrent redemptions cannot exceed
    /// `max_uses`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CouponExhausted`] when the cap is already
    /// reached, or [`EngineError::InvalidInput`] for an unknown code.
    async fn redeem(
        &self,
        code: &str,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<CouponRedemption>;

    /// Returns all redemptions recorded for a code, oldest first.
    async fn redemptions_for(&self, code: &str) -> Result<Vec<CouponRedemption>>;
}

#[derive(Debug, Default)]
struct CouponTable {
    coupons: HashMap<String, Coupon>,
    redemptions: Vec<CouponRedemption>,
}

/// In-memory [`CouponStore`] used in tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryCouponStore {
    inner: Mutex<CouponTable>,
}

impl InMemoryCouponStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a coupon.
    pub async fn seed(&self, coupon: Coupon) {
        let mut table = self.inner.lock().await;
        table.coupons.insert(coupon.code.clone(), coupon);
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn fetch(&self, code: &str) -> Result<Option<Coupon>> {
        let table = self.inner.lock().await;
        Ok(table.coupons.get(code).cloned())
    }

    async fn redeem(
        &self,
        code: &str,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<CouponRedemption> {
        let mut table = self.inner.lock().await;

        let coupon = table
            .coupons
            .get_mut(code)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown coupon code '{code}'")))?;

        if coupon.used_count >= coupon.max_uses {
            return Err(EngineError::CouponExhausted(code.to_string()));
        }
        coupon.used_count += 1;

        let redemption = CouponRedemption {
            coupon_code: code.to_string(),
            user_id: user_id.to_string(),
            subscription_id: subscription_id.to_string(),
            redeemed_at: Utc::now(),
        };
        table.redemptions.push(redemption.clone());
        Ok(redemption)
    }

    async fn redemptions_for(&self, code: &str) -> Result<Vec<CouponRedemption>> {
        let table = self.inner.lock().await;
        Ok(table
            .redemptions
            .iter()
            .filter(|r| r.coupon_code == code)
            .cloned()
            .collect())
    }
}

/// Validates coupons and records redemptions against a [`CouponStore`].
#[derive(Debug, Clone)]
pub struct CouponEngine {
    store: Arc<dyn CouponStore>,
}

impl CouponEngine {
    /// Creates an engine over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn CouponStore>) -> Self {
        Self { store }
    }

    /// Validates a coupon code for a role, returning the coupon if it can
    /// be applied right now.
    ///
    /// Any reason the coupon cannot be applied, including a store failure
    /// during lookup, degrades to `None`; checkout continues without a
    /// discount.
    pub async fn validate(&self, code: &str, user_type: UserType) -> Option<Coupon> {
        self.validate_at(code, user_type, Utc::now()).await
    }

    /// [`validate`](Self::validate) with an explicit clock, for callers
    /// that need deterministic window checks.
    pub async fn validate_at(
        &self,
        code: &str,
        user_type: UserType,
        now: DateTime<Utc>,
    ) -> Option<Coupon> {
        let code = code.trim();
        if code.is_empty() {
            return None;
        }

        let coupon = match self.store.fetch(code).await {
            Ok(Some(coupon)) => coupon,
            Ok(None) => {
                debug!(code, "unknown coupon code");
                return None;
            }
            Err(error) => {
                warn!(code, %error, "coupon lookup failed, continuing without discount");
                return None;
            }
        };

        if !coupon.applies_to_role(user_type) {
            debug!(code, user_type = %user_type, "coupon does not apply to role");
            return None;
        }

        if !coupon.is_live(now) {
            debug!(code, "coupon is not currently redeemable");
            return None;
        }

        Some(coupon)
    }

    /// Records a redemption for a completed purchase.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CouponExhausted`] if the cap was consumed
    /// by concurrent redemptions since validation.
    pub async fn record_redemption(
        &self,
        code: &str,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<CouponRedemption> {
        let redemption = self.store.redeem(code, user_id, subscription_id).await?;
        info!(code, user_id, subscription_id, "coupon redemption recorded");
        Ok(redemption)
    }
}
