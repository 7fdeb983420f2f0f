//! Payment backend seam.
//!
//! The engine never talks to gateway provider APIs directly; a trusted
//! backend owns the provider credentials and exposes four endpoints:
//! order creation, provider-subscription creation, trial creation and
//! payment verification. [`PaymentBackend`] is the seam, and
//! [`HttpPaymentBackend`] is the production implementation over HTTPS.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{BillingInterval, PlanId, UserType};
use crate::error::{EngineError, Result};
use crate::gateway::ProviderRef;
use crate::pricing::TaxBreakdown;

pub mod http;

pub use http::HttpPaymentBackend;

/// Maximum receipt length accepted by order creation.
pub const MAX_RECEIPT_LENGTH: usize = 40;

/// Converts a decimal amount into integer minor units (paise, cents).
///
/// Rounds half away from zero at the subunit boundary.
///
/// # Errors
///
/// Returns [`EngineError::InvalidInput`] for negative amounts or amounts
/// too large to express in an `i64`.
pub fn to_minor_units(amount: Decimal) -> Result<i64> {
    if amount.is_sign_negative() {
        return Err(EngineError::InvalidInput(format!(
            "amount cannot be negative, got {amount}"
        )));
    }

    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|rounded| rounded.to_i64())
        .ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "amount {amount} cannot be represented in minor units"
            ))
        })
}

/// Builds a unique order receipt that fits the backend's length cap.
///
/// The prefix is configured per deployment; the unique part is 96 random
/// bits, short enough to keep the whole receipt under
/// [`MAX_RECEIPT_LENGTH`].
#[must_use]
pub fn make_receipt(prefix: &str) -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &unique[..24])
}

/// Request body for the create-order endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderRequest {
    /// Amount in minor units of the currency.
    pub amount_minor: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Caller-supplied receipt string.
    pub receipt: String,
}

impl CreateOrderRequest {
    /// Builds a request, converting the amount to minor units and
    /// validating the receipt.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] for a non-representable
    /// amount, an empty receipt, or a receipt longer than
    /// [`MAX_RECEIPT_LENGTH`].
    pub fn new(amount: Decimal, currency: &str, receipt: &str) -> Result<Self> {
        if receipt.is_empty() {
            return Err(EngineError::InvalidInput(
                "order receipt cannot be empty".to_string(),
            ));
        }
        if receipt.len() > MAX_RECEIPT_LENGTH {
            return Err(EngineError::InvalidInput(format!(
                "order receipt exceeds {MAX_RECEIPT_LENGTH} characters: '{receipt}'"
            )));
        }

        Ok(Self {
            amount_minor: to_minor_units(amount)?,
            currency: currency.to_string(),
            receipt: receipt.to_string(),
        })
    }
}

/// Response from the create-order endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderResponse {
    /// Provider order id to collect payment against.
    pub order_id: String,
}

/// Request body for the create-subscription endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSubscriptionRequest {
    /// Paying user.
    pub user_id: String,
    /// Plan name registered with the provider.
    pub plan_name: String,
    /// Recurring charge per period, tax included.
    pub amount: Decimal,
    /// Billing interval.
    pub interval: BillingInterval,
}

/// Response from the create-subscription endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionResponse {
    /// Provider subscription id to collect the first payment against.
    pub subscription_id: String,
}

/// Request body for the create-trial-subscription endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTrialRequest {
    /// User starting the trial.
    pub user_id: String,
    /// Plan name registered with the provider.
    pub plan_name: String,
    /// Billing interval after conversion.
    pub interval: BillingInterval,
    /// Trial length in days.
    pub trial_days: u32,
    /// Recurring charge once the trial converts, tax included.
    pub recurring_amount: Decimal,
}

/// Response from the create-trial-subscription endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTrialResponse {
    /// Provider subscription id holding the future mandate.
    pub subscription_id: String,
    /// When the trial clock started on the provider side.
    pub trial_start: DateTime<Utc>,
}

/// Request body for the verify endpoint.
///
/// Carries the gateway identifiers plus enough context for the backend
/// to recompute the expected amount on its own and compare.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyPaymentRequest {
    /// Captured payment id reported by the gateway.
    pub payment_id: String,
    /// Provider order being settled, for one-off purchases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Provider subscription being settled, for autopay purchases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Gateway signature, when the provider issues one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Paying user.
    pub user_id: String,
    /// Plan that was purchased.
    pub plan_id: PlanId,
    /// Role the plan was purchased under.
    pub user_type: UserType,
    /// Base amount after discount, before tax.
    pub base_amount: Decimal,
    /// Coupon that produced the discount, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
    /// Tax line the engine computed.
    pub tax: TaxBreakdown,
    /// Billing interval.
    pub interval: BillingInterval,
    /// Checkout country, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Whether the purchase set up a recurring mandate.
    pub autopay: bool,
}

impl VerifyPaymentRequest {
    /// Fills the order or subscription id from a provider reference.
    #[must_use]
    pub fn with_reference(mut self, reference: &ProviderRef) -> Self {
        match reference {
            ProviderRef::Order(id) => self.order_id = Some(id.clone()),
            ProviderRef::Subscription(id) => self.subscription_id = Some(id.clone()),
        }
        self
    }
}

/// Response from the verify endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPaymentResponse {
    /// Whether the backend confirmed the payment.
    pub verified: bool,
    /// Rejection detail when not verified.
    #[serde(default)]
    pub detail: Option<String>,
}

/// The four payment endpoints the engine depends on.
#[async_trait]
pub trait PaymentBackend: Send + Sync + std::fmt::Debug {
    /// Creates a one-off payment order.
    async fn create_order(&self, request: CreateOrderRequest) -> Result<CreateOrderResponse>;

    /// Creates a recurring provider subscription.
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse>;

    /// Creates a provider subscription that starts with a free trial.
    async fn create_trial_subscription(
        &self,
        request: CreateTrialRequest,
    ) -> Result<CreateTrialResponse>;

    /// Verifies a captured payment against provider records.
    async fn verify(&self, request: VerifyPaymentRequest) -> Result<VerifyPaymentResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Minor units =====

    #[test]
    fn test_minor_units_for_whole_amounts() {
        assert_eq!(to_minor_units(Decimal::from(118)).unwrap(), 11800);
        assert_eq!(to_minor_units(Decimal::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_minor_units_for_fractional_amounts() {
        assert_eq!(to_minor_units(Decimal::new(9440, 2)).unwrap(), 9440);
        assert_eq!(to_minor_units(Decimal::new(15, 2)).unwrap(), 15);
    }

    #[test]
    fn test_minor_units_round_half_away_from_zero() {
        // 0.855 lands on a midpoint at the subunit boundary.
        assert_eq!(to_minor_units(Decimal::new(855, 3)).unwrap(), 86);
    }

    #[test]
    fn test_minor_units_reject_negative() {
        let error = to_minor_units(Decimal::from(-1)).unwrap_err();
        assert!(error.to_string().contains("negative"));
    }

    // ===== Receipts =====

    #[test]
    fn test_receipt_fits_the_cap() {
        let receipt = make_receipt("ord");
        assert!(receipt.len() <= MAX_RECEIPT_LENGTH);
        assert!(receipt.starts_with("ord_"));
    }

    #[test]
    fn test_receipts_are_unique() {
        assert_ne!(make_receipt("ord"), make_receipt("ord"));
    }

    #[test]
    fn test_longest_allowed_prefix_still_fits() {
        let receipt = make_receipt("abcdefgh");
        assert!(receipt.len() <= MAX_RECEIPT_LENGTH);
    }

    // ===== Request construction =====

    #[test]
    fn test_create_order_request_converts_amount() {
        let request =
            CreateOrderRequest::new(Decimal::new(11800, 2), "INR", "ord_abc123").unwrap();
        assert_eq!(request.amount_minor, 11800);
        assert_eq!(request.currency, "INR");
    }

    #[test]
    fn test_create_order_request_rejects_long_receipt() {
        let receipt = "r".repeat(MAX_RECEIPT_LENGTH + 1);
        let error = CreateOrderRequest::new(Decimal::from(100), "INR", &receipt).unwrap_err();
        assert!(error.to_string().contains("exceeds"));
    }

    #[test]
    fn test_create_order_request_rejects_empty_receipt() {
        assert!(CreateOrderRequest::new(Decimal::from(100), "INR", "").is_err());
    }

    #[test]
    fn test_verify_request_reference_fills_the_right_field() {
        let base = VerifyPaymentRequest {
            payment_id: "pay_1".to_string(),
            order_id: None,
            subscription_id: None,
            signature: None,
            user_id: "user-1".to_string(),
            plan_id: PlanId::new("startup-pro-monthly").unwrap(),
            user_type: UserType::Startup,
            base_amount: Decimal::from(100),
            coupon_code: None,
            tax: TaxBreakdown::compute(Decimal::from(100), Decimal::from(18)).unwrap(),
            interval: BillingInterval::Monthly,
            country: Some("IN".to_string()),
            autopay: false,
        };

        let with_order = base
            .clone()
            .with_reference(&ProviderRef::Order("order_9".to_string()));
        assert_eq!(with_order.order_id.as_deref(), Some("order_9"));
        assert!(with_order.subscription_id.is_none());

        let with_sub = base.with_reference(&ProviderRef::Subscription("sub_9".to_string()));
        assert_eq!(with_sub.subscription_id.as_deref(), Some("sub_9"));
        assert!(with_sub.order_id.is_none());
    }

    #[test]
    fn test_verify_request_omits_absent_fields_on_the_wire() {
        let request = VerifyPaymentRequest {
            payment_id: "pay_1".to_string(),
            order_id: Some("order_1".to_string()),
            subscription_id: None,
            signature: None,
            user_id: "user-1".to_string(),
            plan_id: PlanId::new("p").unwrap(),
            user_type: UserType::Startup,
            base_amount: Decimal::from(100),
            coupon_code: None,
            tax: TaxBreakdown::compute(Decimal::from(100), Decimal::from(18)).unwrap(),
            interval: BillingInterval::Monthly,
            country: None,
            autopay: false,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["order_id"], "order_1");
        assert!(json.get("subscription_id").is_none());
        assert!(json.get("signature").is_none());
        assert!(json.get("country").is_none());
        assert_eq!(json["tax"]["total"], "118.00");
    }
}
