//! The subscription ledger.
//!
//! All subscription state changes funnel through [`SubscriptionLedger`],
//! which owns three invariants:
//!
//! - an identity has at most one active row at a time
//! - the trial-usage marker never goes back to unused
//! - a coupon redemption lands before any row it pays for is activated,
//!   so losing a cap race aborts the write cleanly
//!
//! The ledger does not know about gateways beyond recording which one a
//! purchase went through; payment collection and verification happen
//! upstream of it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::catalog::{SubscriptionPlan, UserType};
use crate::error::{EngineError, Result};
use crate::gateway::{Gateway, MandateRef};
use crate::pricing::{Coupon, CouponEngine, TaxBreakdown};

pub mod records;
pub mod store;
pub mod trial;

pub use records::{
    BillingIdentity, IdentityResolution, MandateStatus, SubscriptionId, SubscriptionStatus,
    UserSubscription, resolve_billing_identity,
};
pub use store::{InMemorySubscriptionStore, SubscriptionStore};
pub use trial::TrialManager;

/// Write-side of the subscription system.
#[derive(Debug, Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn SubscriptionStore>,
    coupons: CouponEngine,
    default_role: UserType,
    default_currency: String,
}

impl SubscriptionLedger {
    /// Creates a ledger over a store.
    ///
    /// `default_role` is the fallback used during identity resolution
    /// when no identity matches the purchased plan's role. Rows bill in
    /// the plan's currency, falling back to [`catalog::DEFAULT_CURRENCY`]
    /// unless [`SubscriptionLedger::with_default_currency`] overrides it.
    ///
    /// [`catalog::DEFAULT_CURRENCY`]: crate::catalog::DEFAULT_CURRENCY
    #[must_use]
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        coupons: CouponEngine,
        default_role: UserType,
    ) -> Self {
        Self {
            store,
            coupons,
            default_role,
            default_currency: crate::catalog::DEFAULT_CURRENCY.to_string(),
        }
    }

    /// Sets the currency used for plans that do not name one.
    #[must_use]
    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into();
        self
    }

    /// Resolves the billing identity a purchase belongs to.
    ///
    /// Ambiguous resolutions pick the most recent candidate and log the
    /// tie at WARN; they do not fail the purchase.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IdentityNotFound`] when the user holds no
    /// identities at all.
    pub async fn resolve_identity(&self, user_id: &str, role: UserType) -> Result<BillingIdentity> {
        let identities = self.store.identities_for(user_id).await?;

        match resolve_billing_identity(&identities, role, self.default_role) {
            IdentityResolution::Resolved(identity) => Ok(identity),
            IdentityResolution::Ambiguous(candidates) => {
                let Some(winner) = candidates.first().cloned() else {
                    return Err(EngineError::IdentityNotFound(user_id.to_string()));
                };
                warn!(
                    user_id,
                    role = %role,
                    candidates = candidates.len(),
                    picked = %winner.id,
                    "ambiguous billing identity, picking most recent"
                );
                Ok(winner)
            }
            IdentityResolution::NotFound => {
                Err(EngineError::IdentityNotFound(user_id.to_string()))
            }
        }
    }

    /// Fetches a row by id.
    pub async fn fetch(&self, id: &SubscriptionId) -> Result<Option<UserSubscription>> {
        self.store.fetch(id).await
    }

    /// The identity's active row, if any.
    pub async fn active(&self, identity_id: &str) -> Result<Option<UserSubscription>> {
        self.store.active_for(identity_id).await
    }

    /// Every row ever written for an identity, oldest first.
    pub async fn history(&self, identity_id: &str) -> Result<Vec<UserSubscription>> {
        self.store.history_for(identity_id).await
    }

    /// Attaches a mandate to a row after a verified payment.
    pub async fn attach_mandate(
        &self,
        id: &SubscriptionId,
        mandate: MandateRef,
        status: MandateStatus,
        autopay: bool,
    ) -> Result<UserSubscription> {
        self.store.update_mandate(id, mandate, status, autopay).await
    }

    /// Upserts the subscription for a completed purchase.
    ///
    /// Resolves the identity, prices the row (coupon first, then tax,
    /// recomputed here unless the caller already priced it), stamps a
    /// billing period starting now, records any coupon redemption, and
    /// activates the row exclusively. The redemption happens before
    /// activation: a coupon whose cap was consumed mid-checkout aborts
    /// the upsert with [`EngineError::CouponExhausted`] and no row is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IdentityNotFound`] when the user has no
    /// billing identity, [`EngineError::CouponExhausted`] on a lost cap
    /// race, or any store error.
    #[instrument(skip(self, plan, coupon, tax), fields(user_id, plan_id = %plan.id))]
    pub async fn upsert(
        &self,
        plan: &SubscriptionPlan,
        user_id: &str,
        coupon: Option<&Coupon>,
        tax: Option<&TaxBreakdown>,
        gateway: Option<Gateway>,
    ) -> Result<UserSubscription> {
        let identity = self.resolve_identity(user_id, plan.user_type).await?;

        match self.store.latest_for(&identity.id).await? {
            Some(previous) => debug!(
                identity_id = %identity.id,
                previous = %previous.id,
                "replacing existing subscription"
            ),
            None => debug!(identity_id = %identity.id, "first subscription for identity"),
        }

        let amount = match coupon {
            Some(coupon) => coupon.apply(plan.base_price)?,
            None => plan.base_price,
        };
        let tax_line = match tax {
            Some(tax) => tax.clone(),
            None => TaxBreakdown::compute(amount, plan.tax_percentage)?,
        };

        let period_start = Utc::now();
        let period_end = plan.interval.advance(period_start)?;
        let currency = plan.currency_or(&self.default_currency).to_string();

        let row = UserSubscription::new_paid(
            &identity,
            plan,
            amount,
            &tax_line,
            currency,
            period_start,
            period_end,
            coupon.map(|c| c.code.clone()),
            gateway,
        );

        if let Some(coupon) = coupon {
            self.coupons
                .record_redemption(&coupon.code, user_id, row.id.as_str())
                .await?;
        }

        let stored = self.store.activate_exclusive(row).await?;
        info!(
            subscription_id = %stored.id,
            identity_id = %stored.identity_id,
            total = %stored.total_amount,
            "subscription upserted"
        );
        Ok(stored)
    }

    /// Activates a free trial row for an identity.
    ///
    /// Eligibility is checked by [`TrialManager`]; this only performs
    /// the write.
    pub async fn activate_trial(
        &self,
        plan: &SubscriptionPlan,
        user_id: &str,
        trial_start: DateTime<Utc>,
        trial_end: DateTime<Utc>,
        mandate: Option<MandateRef>,
    ) -> Result<UserSubscription> {
        let identity = self.resolve_identity(user_id, plan.user_type).await?;
        let currency = plan.currency_or(&self.default_currency).to_string();
        let row =
            UserSubscription::new_trial(&identity, plan, currency, trial_start, trial_end, mandate);
        let stored = self.store.activate_exclusive(row).await?;
        info!(
            subscription_id = %stored.id,
            identity_id = %stored.identity_id,
            trial_end = %trial_end,
            "trial subscription activated"
        );
        Ok(stored)
    }

    /// Cancels the user's active subscription in the given role.
    ///
    /// Ends the row, disables autopay and revokes any mandate in one
    /// store operation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] when nothing is active.
    #[instrument(skip(self), fields(user_id, role = %role))]
    pub async fn cancel(&self, user_id: &str, role: UserType) -> Result<UserSubscription> {
        let identity = self.resolve_identity(user_id, role).await?;
        let Some(active) = self.store.active_for(&identity.id).await? else {
            return Err(EngineError::InvalidInput(format!(
                "no active subscription to cancel for user '{user_id}'"
            )));
        };

        let cancelled = self.store.cancel(&active.id).await?;
        info!(subscription_id = %cancelled.id, "subscription cancelled");
        Ok(cancelled)
    }

    /// Renews the user's active subscription for one more period.
    ///
    /// The successor row starts where the current period ends and keeps
    /// the row's pricing and mandate; coupons apply to the period they
    /// were redeemed for and are not carried forward.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] when nothing is active.
    #[instrument(skip(self), fields(user_id, role = %role))]
    pub async fn renew(&self, user_id: &str, role: UserType) -> Result<UserSubscription> {
        let identity = self.resolve_identity(user_id, role).await?;
        let Some(active) = self.store.active_for(&identity.id).await? else {
            return Err(EngineError::InvalidInput(format!(
                "no active subscription to renew for user '{user_id}'"
            )));
        };

        let period_start = active.period_end;
        let period_end = active.interval.advance(period_start)?;
        let now = Utc::now();

        let mut next = active.clone();
        next.id = SubscriptionId::generate();
        next.status = SubscriptionStatus::Active;
        next.is_in_trial = false;
        next.trial_start = None;
        next.trial_end = None;
        next.coupon_code = None;
        next.period_start = period_start;
        next.period_end = period_end;
        next.created_at = now;
        next.updated_at = now;

        let stored = self.store.activate_exclusive(next).await?;
        info!(
            subscription_id = %stored.id,
            period_end = %stored.period_end,
            "subscription renewed"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal::Decimal;

    use super::*;
    use crate::catalog::{BillingInterval, PlanId, PlanTier};
    use crate::pricing::{CouponStore, DiscountType, InMemoryCouponStore};

    fn plan() -> SubscriptionPlan {
        SubscriptionPlan {
            id: PlanId::new("startup-pro-monthly").unwrap(),
            name: "Startup Pro".to_string(),
            user_type: UserType::Startup,
            tier: PlanTier::Pro,
            base_price: Decimal::from(100),
            currency: Some("INR".to_string()),
            tax_percentage: Decimal::from(18),
            interval: BillingInterval::Monthly,
            country: Some("IN".to_string()),
            active: true,
        }
    }

    fn coupon(code: &str, max_uses: u32, used: u32) -> Coupon {
        Coupon {
            code: code.to_string(),
            discount_type: DiscountType::Percentage,
            discount_value: Decimal::from(20),
            valid_from: None,
            valid_until: None,
            max_uses,
            used_count: used,
            applies_to: None,
            active: true,
        }
    }

    struct Fixture {
        ledger: SubscriptionLedger,
        store: Arc<InMemorySubscriptionStore>,
        coupons: Arc<InMemoryCouponStore>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let coupons = Arc::new(InMemoryCouponStore::new());
        let engine = CouponEngine::new(coupons.clone());
        let ledger = SubscriptionLedger::new(store.clone(), engine, UserType::Startup);
        Fixture {
            ledger,
            store,
            coupons,
        }
    }

    fn identity(id: &str, user_id: &str, role: UserType, age_days: i64) -> BillingIdentity {
        BillingIdentity {
            id: id.to_string(),
            user_id: user_id.to_string(),
            role,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn test_upsert_prices_and_activates() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;

        let row = f
            .ledger
            .upsert(&plan(), "user-1", None, None, Some(Gateway::Razorpay))
            .await
            .unwrap();

        assert!(row.is_active());
        assert_eq!(row.identity_id, "id-1");
        assert_eq!(row.amount, Decimal::from(100));
        assert_eq!(row.tax_percentage, Decimal::from(18));
        assert_eq!(row.tax_amount, Decimal::new(1800, 2));
        assert_eq!(row.total_amount, Decimal::new(11800, 2));
        assert!(row.has_used_trial);
        assert_eq!(row.gateway, Some(Gateway::Razorpay));
    }

    #[tokio::test]
    async fn test_upsert_with_coupon_discounts_and_records_redemption() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;
        f.coupons.seed(coupon("SAVE20", 10, 0)).await;
        let applied = coupon("SAVE20", 10, 0);

        let row = f
            .ledger
            .upsert(&plan(), "user-1", Some(&applied), None, None)
            .await
            .unwrap();

        assert_eq!(row.amount, Decimal::from(80));
        assert_eq!(row.tax_amount, Decimal::new(1440, 2));
        assert_eq!(row.total_amount, Decimal::new(9440, 2));
        assert_eq!(row.coupon_code.as_deref(), Some("SAVE20"));

        let redemptions = f.coupons.redemptions_for("SAVE20").await.unwrap();
        assert_eq!(redemptions.len(), 1);
        assert_eq!(redemptions[0].subscription_id, row.id.as_str());
    }

    #[tokio::test]
    async fn test_upsert_aborts_before_activation_when_cap_lost() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;
        // Cap already consumed between validation and upsert.
        f.coupons.seed(coupon("GONE", 2, 2)).await;
        let stale = coupon("GONE", 2, 0);

        let error = f
            .ledger
            .upsert(&plan(), "user-1", Some(&stale), None, None)
            .await
            .unwrap_err();

        assert!(matches!(error, EngineError::CouponExhausted(_)));
        // No row was activated for the aborted purchase.
        assert!(f.store.history_for("id-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_demotes_previous_subscription() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;

        let first = f
            .ledger
            .upsert(&plan(), "user-1", None, None, None)
            .await
            .unwrap();
        let second = f
            .ledger
            .upsert(&plan(), "user-1", None, None, None)
            .await
            .unwrap();

        let history = f.store.history_for("id-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history.iter().filter(|row| row.is_active()).count(),
            1,
            "exactly one active row"
        );
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_upsert_picks_role_matching_identity() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-startup", "user-1", UserType::Startup, 10))
            .await;
        f.store
            .register_identity(identity("id-investor", "user-1", UserType::Investor, 1))
            .await;

        let row = f
            .ledger
            .upsert(&plan(), "user-1", None, None, None)
            .await
            .unwrap();
        assert_eq!(row.identity_id, "id-startup");
    }

    #[tokio::test]
    async fn test_upsert_without_identity_fails() {
        let f = fixture().await;
        let error = f
            .ledger
            .upsert(&plan(), "ghost", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::IdentityNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_active_subscription() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;
        f.ledger
            .upsert(&plan(), "user-1", None, None, None)
            .await
            .unwrap();

        let cancelled = f.ledger.cancel("user-1", UserType::Startup).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(f.store.active_for("id-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_active_subscription_fails() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;

        let error = f
            .ledger
            .cancel("user-1", UserType::Startup)
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_renew_extends_contiguously_and_drops_coupon() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;
        f.coupons.seed(coupon("SAVE20", 10, 0)).await;
        let applied = coupon("SAVE20", 10, 0);

        let original = f
            .ledger
            .upsert(&plan(), "user-1", Some(&applied), None, None)
            .await
            .unwrap();
        let renewed = f.ledger.renew("user-1", UserType::Startup).await.unwrap();

        assert_eq!(renewed.period_start, original.period_end);
        assert!(renewed.period_end > renewed.period_start);
        // Pricing carries over but the one-shot coupon does not.
        assert_eq!(renewed.amount, original.amount);
        assert!(renewed.coupon_code.is_none());

        let history = f.store.history_for("id-1").await.unwrap();
        assert_eq!(history.iter().filter(|row| row.is_active()).count(), 1);
    }

    #[tokio::test]
    async fn test_activate_trial_writes_free_row() {
        let f = fixture().await;
        f.store
            .register_identity(identity("id-1", "user-1", UserType::Startup, 1))
            .await;

        let start = Utc::now();
        let end = start + Duration::days(30);
        let row = f
            .ledger
            .activate_trial(&plan(), "user-1", start, end, None)
            .await
            .unwrap();

        assert!(row.in_active_trial());
        assert_eq!(row.total_amount, Decimal::ZERO);
        assert!(row.has_used_trial);
    }
}
