//! Gateway success payloads.
//!
//! Each provider returns differently-shaped identifiers on success. The
//! payloads are kept as a tagged union rather than a lowest-common
//! -denominator struct, with accessors for the fields the verifier needs:
//! a payment id, a reference to the order or provider subscription being
//! paid for, and (for autopay) a mandate.

use serde::{Deserialize, Serialize};

use super::{Gateway, MandateRef, ProviderRef};
use crate::error::{EngineError, Result};

/// A successful payment captured by a gateway surface.
///
/// Serialized with a `gateway` tag so payloads stay self-describing on
/// the wire:
///
/// ```json
/// { "gateway": "razorpay", "payment_id": "pay_1", "order_id": "order_1", "signature": "..." }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gateway", rename_all = "snake_case")]
pub enum GatewayResponse {
    /// Fields returned by Razorpay checkout.
    Razorpay {
        /// Captured payment id.
        payment_id: String,
        /// Order being paid, for one-off purchases.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<String>,
        /// Provider subscription being paid, for autopay purchases.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        /// Signature over the payment, checked server-side.
        signature: String,
    },
    /// Fields returned by PayPal checkout.
    Paypal {
        /// Captured payment id.
        capture_id: String,
        /// Order being paid, for one-off purchases.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<String>,
        /// Provider subscription being paid, for autopay purchases.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        /// Paying account, when PayPal includes it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payer_id: Option<String>,
    },
}

impl GatewayResponse {
    /// The gateway that produced this response.
    #[must_use]
    pub fn gateway(&self) -> Gateway {
        match self {
            Self::Razorpay { .. } => Gateway::Razorpay,
            Self::Paypal { .. } => Gateway::Paypal,
        }
    }

    /// The captured payment id, whatever the provider calls it.
    #[must_use]
    pub fn payment_id(&self) -> &str {
        match self {
            Self::Razorpay { payment_id, .. } => payment_id,
            Self::Paypal { capture_id, .. } => capture_id,
        }
    }

    /// The provider signature, when the gateway issues one.
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        match self {
            Self::Razorpay { signature, .. } => Some(signature),
            Self::Paypal { .. } => None,
        }
    }

    /// The order or provider subscription this payment settles.
    ///
    /// Prefers the order id; falls back to the subscription id for
    /// autopay flows that carry no order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Verification`] when the payload names
    /// neither, since such a payment cannot be matched to anything.
    pub fn reference(&self) -> Result<ProviderRef> {
        let (order_id, subscription_id) = match self {
            Self::Razorpay {
                order_id,
                subscription_id,
                ..
            }
            | Self::Paypal {
                order_id,
                subscription_id,
                ..
            } => (order_id, subscription_id),
        };

        if let Some(id) = order_id {
            return Ok(ProviderRef::Order(id.clone()));
        }
        if let Some(id) = subscription_id {
            return Ok(ProviderRef::Subscription(id.clone()));
        }
        Err(EngineError::Verification(format!(
            "gateway response for payment '{}' references neither an order nor a subscription",
            self.payment_id()
        )))
    }

    /// The recurring mandate this payment established, if any.
    ///
    /// Present only when the gateway reported a provider subscription;
    /// the subscription id doubles as the mandate id in its gateway's
    /// namespace.
    #[must_use]
    pub fn mandate_ref(&self) -> Option<MandateRef> {
        let subscription_id = match self {
            Self::Razorpay {
                subscription_id, ..
            }
            | Self::Paypal {
                subscription_id, ..
            } => subscription_id.as_ref()?,
        };
        Some(MandateRef::new(self.gateway(), subscription_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn razorpay_order_payment() -> GatewayResponse {
        GatewayResponse::Razorpay {
            payment_id: "pay_111".to_string(),
            order_id: Some("order_222".to_string()),
            subscription_id: None,
            signature: "sig_333".to_string(),
        }
    }

    fn paypal_subscription_payment() -> GatewayResponse {
        GatewayResponse::Paypal {
            capture_id: "CAP-1".to_string(),
            order_id: None,
            subscription_id: Some("I-SUB1".to_string()),
            payer_id: Some("PAYER9".to_string()),
        }
    }

    #[test]
    fn test_payment_id_per_variant() {
        assert_eq!(razorpay_order_payment().payment_id(), "pay_111");
        assert_eq!(paypal_subscription_payment().payment_id(), "CAP-1");
    }

    #[test]
    fn test_signature_only_on_razorpay() {
        assert_eq!(razorpay_order_payment().signature(), Some("sig_333"));
        assert_eq!(paypal_subscription_payment().signature(), None);
    }

    #[test]
    fn test_reference_prefers_order_id() {
        let response = GatewayResponse::Razorpay {
            payment_id: "pay_1".to_string(),
            order_id: Some("order_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            signature: "sig".to_string(),
        };

        assert_eq!(
            response.reference().unwrap(),
            ProviderRef::Order("order_1".to_string())
        );
    }

    #[test]
    fn test_reference_falls_back_to_subscription_id() {
        let reference = paypal_subscription_payment().reference().unwrap();
        assert_eq!(reference, ProviderRef::Subscription("I-SUB1".to_string()));
    }

    #[test]
    fn test_reference_missing_is_a_verification_error() {
        let response = GatewayResponse::Razorpay {
            payment_id: "pay_1".to_string(),
            order_id: None,
            subscription_id: None,
            signature: "sig".to_string(),
        };

        let error = response.reference().unwrap_err();
        assert!(matches!(error, EngineError::Verification(_)));
        assert!(error.to_string().contains("pay_1"));
    }

    #[test]
    fn test_mandate_ref_only_for_subscription_payments() {
        assert!(razorpay_order_payment().mandate_ref().is_none());

        let mandate = paypal_subscription_payment().mandate_ref().unwrap();
        assert_eq!(mandate.gateway(), Gateway::Paypal);
        assert_eq!(mandate.id(), "I-SUB1");
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let json = serde_json::to_value(razorpay_order_payment()).unwrap();
        assert_eq!(json["gateway"], "razorpay");
        assert_eq!(json["payment_id"], "pay_111");
        assert_eq!(json["order_id"], "order_222");
        // Absent options are omitted entirely.
        assert!(json.get("subscription_id").is_none());

        let parsed: GatewayResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, razorpay_order_payment());
    }

    #[test]
    fn test_unknown_gateway_tag_rejected() {
        let json = serde_json::json!({
            "gateway": "stripe",
            "payment_id": "pay_1",
            "signature": "sig"
        });

        assert!(serde_json::from_value::<GatewayResponse>(json).is_err());
    }
}
