//! Subscription ledger records.
//!
//! The ledger is append-leaning: activations write new rows and demote
//! old ones rather than rewriting history. Rows therefore double as an
//! audit trail, and "most recent" reads drive identity resolution and
//! trial eligibility.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{BillingInterval, PlanId, PlanTier, SubscriptionPlan, UserType};
use crate::error::{EngineError, Result};
use crate::gateway::{Gateway, MandateRef};
use crate::pricing::TaxBreakdown;

/// Maximum length of a subscription identifier.
const MAX_SUBSCRIPTION_ID_LENGTH: usize = 64;

/// A validated subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Creates a subscription id after validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if the id is empty, longer
    /// than 64 characters, or contains characters outside
    /// `[A-Za-z0-9_-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(EngineError::InvalidInput(
                "subscription id cannot be empty".to_string(),
            ));
        }

        if id.len() > MAX_SUBSCRIPTION_ID_LENGTH {
            return Err(EngineError::InvalidInput(format!(
                "subscription id exceeds maximum length of {MAX_SUBSCRIPTION_ID_LENGTH} characters"
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::InvalidInput(format!(
                "subscription id '{id}' contains invalid characters (allowed: alphanumeric, '_', '-')"
            )));
        }

        Ok(Self(id))
    }

    /// Generates a fresh unique identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sub_{}", Uuid::new_v4().simple()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// The row is the identity's current subscription.
    Active,
    /// Superseded by a later activation.
    Inactive,
    /// Ended by the user.
    Cancelled,
    /// A renewal charge failed; access is grace-limited.
    PastDue,
}

impl SubscriptionStatus {
    /// Returns the wire-format name of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Cancelled => "cancelled",
            Self::PastDue => "past_due",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a row's recurring-payment mandate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MandateStatus {
    /// The purchase did not ask for a mandate.
    #[default]
    NotRequested,
    /// A mandate exists but has not collected a charge yet.
    Pending,
    /// The mandate has been confirmed by a successful charge.
    Confirmed,
    /// The mandate was revoked on cancellation.
    Revoked,
}

/// A billing identity: one user acting in one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingIdentity {
    /// Stable identity id, the key subscriptions hang off.
    pub id: String,
    /// The user behind the identity.
    pub user_id: String,
    /// Role the identity belongs to.
    pub role: UserType,
    /// When the identity was created.
    pub created_at: DateTime<Utc>,
}

/// Outcome of resolving which billing identity a purchase belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityResolution {
    /// Exactly one identity won under the resolution rules.
    Resolved(BillingIdentity),
    /// Multiple identities tied at the winning priority, most recent
    /// first. Callers pick the head and should log the tie.
    Ambiguous(Vec<BillingIdentity>),
    /// The user holds no identities.
    NotFound,
}

/// Resolves the billing identity a purchase belongs to.
///
/// Priority order:
/// 1. identities whose role matches the plan being bought
/// 2. identities in the configured default role
/// 3. the most recently created identity of any role
///
/// A single winner resolves; several candidates at the same priority
/// come back as [`IdentityResolution::Ambiguous`], ordered most recent
/// first so callers have a deterministic tie-break.
#[must_use]
pub fn resolve_billing_identity(
    identities: &[BillingIdentity],
    target_role: UserType,
    default_role: UserType,
) -> IdentityResolution {
    if identities.is_empty() {
        return IdentityResolution::NotFound;
    }

    let newest_first = |candidates: &mut Vec<BillingIdentity>| {
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    };

    let mut matching: Vec<BillingIdentity> = identities
        .iter()
        .filter(|i| i.role == target_role)
        .cloned()
        .collect();
    newest_first(&mut matching);

    match matching.len() {
        1 => return IdentityResolution::Resolved(matching.remove(0)),
        n if n > 1 => return IdentityResolution::Ambiguous(matching),
        _ => {}
    }

    let mut defaults: Vec<BillingIdentity> = identities
        .iter()
        .filter(|i| i.role == default_role)
        .cloned()
        .collect();
    newest_first(&mut defaults);

    match defaults.len() {
        1 => return IdentityResolution::Resolved(defaults.remove(0)),
        n if n > 1 => return IdentityResolution::Ambiguous(defaults),
        _ => {}
    }

    let mut all: Vec<BillingIdentity> = identities.to_vec();
    newest_first(&mut all);
    IdentityResolution::Resolved(all.remove(0))
}

/// One row in the subscription ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSubscription {
    /// Unique row id.
    pub id: SubscriptionId,
    /// Billing identity the row belongs to.
    pub identity_id: String,
    /// User behind the identity, denormalized for reads.
    pub user_id: String,
    /// Plan purchased.
    pub plan_id: PlanId,
    /// Plan name at purchase time.
    pub plan_name: String,
    /// Role the plan was purchased under.
    pub user_type: UserType,
    /// Plan tier at purchase time.
    pub tier: PlanTier,
    /// Billing interval.
    pub interval: BillingInterval,
    /// Base amount per period after discount, before tax.
    pub amount: Decimal,
    /// Tax rate the period bills under, as a percentage.
    pub tax_percentage: Decimal,
    /// Tax per period.
    pub tax_amount: Decimal,
    /// Total charged per period.
    pub total_amount: Decimal,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Lifecycle status.
    pub status: SubscriptionStatus,
    /// Whether the row is currently inside its trial window.
    pub is_in_trial: bool,
    /// Trial window start, for rows that began as trials.
    pub trial_start: Option<DateTime<Utc>>,
    /// Trial window end, for rows that began as trials.
    pub trial_end: Option<DateTime<Utc>>,
    /// Sticky marker: this identity has consumed its one free trial.
    /// Never transitions back to `false`.
    pub has_used_trial: bool,
    /// Current billing period start.
    pub period_start: DateTime<Utc>,
    /// Current billing period end.
    pub period_end: DateTime<Utc>,
    /// Gateway the purchase went through, when one was involved.
    pub gateway: Option<Gateway>,
    /// Recurring mandate at the gateway, once attached.
    pub mandate: Option<MandateRef>,
    /// State of the mandate.
    pub mandate_status: MandateStatus,
    /// Whether renewals charge automatically.
    pub autopay_enabled: bool,
    /// Coupon redeemed for this row, if any.
    pub coupon_code: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl UserSubscription {
    /// Builds an active paid row.
    ///
    /// Paid rows are never trial rows, and any paid activation marks the
    /// trial as consumed so a later downgrade cannot re-open it.
    #[must_use]
    #[allow(
        clippy::too_many_arguments,
        reason = "row construction needs the full pricing and period context"
    )]
    pub fn new_paid(
        identity: &BillingIdentity,
        plan: &SubscriptionPlan,
        amount: Decimal,
        tax: &TaxBreakdown,
        currency: String,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        coupon_code: Option<String>,
        gateway: Option<Gateway>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::generate(),
            identity_id: identity.id.clone(),
            user_id: identity.user_id.clone(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            user_type: plan.user_type,
            tier: plan.tier,
            interval: plan.interval,
            amount,
            tax_percentage: tax.percentage,
            tax_amount: tax.amount,
            total_amount: tax.total,
            currency,
            status: SubscriptionStatus::Active,
            is_in_trial: false,
            trial_start: None,
            trial_end: None,
            has_used_trial: true,
            period_start,
            period_end,
            gateway,
            mandate: None,
            mandate_status: MandateStatus::NotRequested,
            autopay_enabled: false,
            coupon_code,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds an active trial row.
    ///
    /// Trial rows charge nothing, sit inside their trial window, and
    /// consume the identity's one free trial in the same write.
    #[must_use]
    pub fn new_trial(
        identity: &BillingIdentity,
        plan: &SubscriptionPlan,
        currency: String,
        trial_start: DateTime<Utc>,
        trial_end: DateTime<Utc>,
        mandate: Option<MandateRef>,
    ) -> Self {
        let now = Utc::now();
        let gateway = mandate.as_ref().map(MandateRef::gateway);
        let mandate_status = if mandate.is_some() {
            MandateStatus::Pending
        } else {
            MandateStatus::NotRequested
        };
        let autopay_enabled = mandate.is_some();

        Self {
            id: SubscriptionId::generate(),
            identity_id: identity.id.clone(),
            user_id: identity.user_id.clone(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            user_type: plan.user_type,
            tier: plan.tier,
            interval: plan.interval,
            amount: Decimal::ZERO,
            tax_percentage: plan.tax_percentage,
            tax_amount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            currency,
            status: SubscriptionStatus::Active,
            is_in_trial: true,
            trial_start: Some(trial_start),
            trial_end: Some(trial_end),
            has_used_trial: true,
            period_start: trial_start,
            period_end: trial_end,
            gateway,
            mandate,
            mandate_status,
            autopay_enabled,
            coupon_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this row is the identity's current subscription.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether this row is an active, still-running trial.
    #[must_use]
    pub fn in_active_trial(&self) -> bool {
        self.is_active() && self.is_in_trial
    }

    /// Demotes the row when a newer activation supersedes it.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Inactive;
        self.is_in_trial = false;
        self.updated_at = now;
    }

    /// Attaches a confirmed mandate after a verified payment.
    pub fn attach_mandate(&mut self, mandate: MandateRef, status: MandateStatus, autopay: bool) {
        self.gateway = Some(mandate.gateway());
        self.mandate = Some(mandate);
        self.mandate_status = status;
        self.autopay_enabled = autopay;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
#[allow(
    clippy::unreachable,
    reason = "test code uses unreachable! for impossible match arms"
)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn identity(id: &str, role: UserType, age_days: i64) -> BillingIdentity {
        BillingIdentity {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            role,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

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

    // ===== Subscription ids =====

    #[test]
    fn test_subscription_id_validation() {
        assert!(SubscriptionId::new("sub_abc-123").is_ok());
        assert!(SubscriptionId::new("").is_err());
        assert!(SubscriptionId::new("x".repeat(65)).is_err());
        assert!(SubscriptionId::new("bad id").is_err());
    }

    #[test]
    fn test_generated_ids_validate_and_differ() {
        let a = SubscriptionId::generate();
        let b = SubscriptionId::generate();
        assert_ne!(a, b);
        assert!(SubscriptionId::new(a.as_str()).is_ok());
    }

    // ===== Identity resolution =====

    #[test]
    fn test_resolution_prefers_role_match() {
        let identities = vec![
            identity("id-startup", UserType::Startup, 10),
            identity("id-investor", UserType::Investor, 1),
        ];

        let resolution =
            resolve_billing_identity(&identities, UserType::Investor, UserType::Startup);
        let IdentityResolution::Resolved(winner) = resolution else {
            unreachable!("expected a resolved identity");
        };
        assert_eq!(winner.id, "id-investor");
    }

    #[test]
    fn test_resolution_falls_back_to_default_role() {
        let identities = vec![
            identity("id-startup", UserType::Startup, 10),
            identity("id-advisor", UserType::Advisor, 1),
        ];

        let resolution =
            resolve_billing_identity(&identities, UserType::Mentor, UserType::Startup);
        let IdentityResolution::Resolved(winner) = resolution else {
            unreachable!("expected a resolved identity");
        };
        assert_eq!(winner.id, "id-startup");
    }

    #[test]
    fn test_resolution_falls_back_to_most_recent() {
        let identities = vec![
            identity("id-old", UserType::Advisor, 30),
            identity("id-new", UserType::Investor, 2),
        ];

        let resolution =
            resolve_billing_identity(&identities, UserType::Mentor, UserType::Startup);
        let IdentityResolution::Resolved(winner) = resolution else {
            unreachable!("expected a resolved identity");
        };
        assert_eq!(winner.id, "id-new");
    }

    #[test]
    fn test_resolution_reports_ties_as_ambiguous() {
        let identities = vec![
            identity("id-older", UserType::Startup, 20),
            identity("id-newer", UserType::Startup, 5),
        ];

        let resolution =
            resolve_billing_identity(&identities, UserType::Startup, UserType::Startup);
        let IdentityResolution::Ambiguous(candidates) = resolution else {
            unreachable!("expected an ambiguous resolution");
        };
        // Most recent first gives callers a deterministic pick.
        assert_eq!(candidates[0].id, "id-newer");
        assert_eq!(candidates[1].id, "id-older");
    }

    #[test]
    fn test_resolution_of_no_identities_is_not_found() {
        let resolution = resolve_billing_identity(&[], UserType::Startup, UserType::Startup);
        assert_eq!(resolution, IdentityResolution::NotFound);
    }

    // ===== Row construction =====

    #[test]
    fn test_paid_row_is_never_a_trial_row() {
        let identity = identity("id-1", UserType::Startup, 1);
        let tax = TaxBreakdown::compute(Decimal::from(100), Decimal::from(18)).unwrap();
        let start = Utc::now();
        let end = start + Duration::days(30);

        let row = UserSubscription::new_paid(
            &identity,
            &plan(),
            Decimal::from(100),
            &tax,
            "INR".to_string(),
            start,
            end,
            None,
            Some(Gateway::Razorpay),
        );

        assert!(row.is_active());
        assert!(!row.is_in_trial);
        assert!(row.has_used_trial);
        assert_eq!(row.amount, Decimal::from(100));
        assert_eq!(row.tax_percentage, Decimal::from(18));
        assert_eq!(row.tax_amount, Decimal::new(1800, 2));
        assert_eq!(row.total_amount, Decimal::new(11800, 2));
    }

    #[test]
    fn test_trial_row_is_free_and_consumes_the_trial() {
        let identity = identity("id-1", UserType::Startup, 1);
        let start = Utc::now();
        let end = start + Duration::days(30);
        let mandate = MandateRef::new(Gateway::Razorpay, "sub_provider_1");

        let row = UserSubscription::new_trial(
            &identity,
            &plan(),
            "INR".to_string(),
            start,
            end,
            Some(mandate),
        );

        assert!(row.in_active_trial());
        assert!(row.has_used_trial);
        assert_eq!(row.amount, Decimal::ZERO);
        assert_eq!(row.total_amount, Decimal::ZERO);
        assert_eq!(row.mandate_status, MandateStatus::Pending);
        assert!(row.autopay_enabled);
        assert_eq!(row.gateway, Some(Gateway::Razorpay));
    }

    #[test]
    fn test_trial_row_without_mandate_has_no_autopay() {
        let identity = identity("id-1", UserType::Startup, 1);
        let start = Utc::now();
        let row = UserSubscription::new_trial(
            &identity,
            &plan(),
            "INR".to_string(),
            start,
            start + Duration::days(30),
            None,
        );

        assert_eq!(row.mandate_status, MandateStatus::NotRequested);
        assert!(!row.autopay_enabled);
        assert!(row.gateway.is_none());
    }

    #[test]
    fn test_deactivation_clears_trial_flag_but_not_usage() {
        let identity = identity("id-1", UserType::Startup, 1);
        let start = Utc::now();
        let mut row = UserSubscription::new_trial(
            &identity,
            &plan(),
            "INR".to_string(),
            start,
            start + Duration::days(30),
            None,
        );

        row.deactivate(Utc::now());

        assert_eq!(row.status, SubscriptionStatus::Inactive);
        assert!(!row.is_in_trial);
        // The sticky marker survives demotion.
        assert!(row.has_used_trial);
    }

    #[test]
    fn test_attach_mandate_marks_gateway_and_autopay() {
        let identity = identity("id-1", UserType::Startup, 1);
        let tax = TaxBreakdown::compute(Decimal::from(100), Decimal::from(18)).unwrap();
        let start = Utc::now();
        let mut row = UserSubscription::new_paid(
            &identity,
            &plan(),
            Decimal::from(100),
            &tax,
            "INR".to_string(),
            start,
            start + Duration::days(30),
            None,
            None,
        );

        row.attach_mandate(
            MandateRef::new(Gateway::Paypal, "I-123"),
            MandateStatus::Confirmed,
            true,
        );

        assert_eq!(row.mandate_status, MandateStatus::Confirmed);
        assert!(row.autopay_enabled);
        assert_eq!(row.gateway, Some(Gateway::Paypal));
        assert_eq!(row.mandate.as_ref().map(MandateRef::id), Some("I-123"));
    }
}
