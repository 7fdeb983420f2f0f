//! Gateway routing and provider-scoped identifiers.
//!
//! A checkout picks its gateway exactly once, before any provider call,
//! and every later step reads that captured choice. Selection is a pure
//! function of the checkout context, so re-running it cannot route one
//! checkout through two providers.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod response;
pub mod sdk;

pub use response::GatewayResponse;
pub use sdk::{GatewayClient, PaymentPrompt, SdkLoader, UserAction};

/// A supported payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gateway {
    /// Razorpay, used for the Indian home market.
    Razorpay,
    /// PayPal, used everywhere else.
    Paypal,
}

impl Gateway {
    /// Returns the wire-format name of this gateway.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Razorpay => "razorpay",
            Self::Paypal => "paypal",
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway used when the checkout context carries no routing signal.
pub const DEFAULT_GATEWAY: Gateway = Gateway::Razorpay;

/// Selects the gateway for a checkout context.
///
/// Pure and total: the same context always yields the same gateway.
/// Indian checkouts route to Razorpay, any other known country routes to
/// PayPal, and a missing country falls back to `default`.
///
/// # Examples
///
/// ```
/// use billing_orchestrator::gateway::{DEFAULT_GATEWAY, Gateway, select_gateway};
///
/// assert_eq!(select_gateway(Some("IN"), DEFAULT_GATEWAY), Gateway::Razorpay);
/// assert_eq!(select_gateway(Some("US"), DEFAULT_GATEWAY), Gateway::Paypal);
/// assert_eq!(select_gateway(None, Gateway::Paypal), Gateway::Paypal);
/// ```
#[must_use]
pub fn select_gateway(country: Option<&str>, default: Gateway) -> Gateway {
    match country {
        Some(code) if code.eq_ignore_ascii_case("IN") => Gateway::Razorpay,
        Some(_) => Gateway::Paypal,
        None => default,
    }
}

/// A provider-side object created before payment collection.
///
/// One-off purchases create an order; autopay purchases create a
/// provider subscription. Verification and receipts refer back to
/// whichever one the checkout created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ProviderRef {
    /// A one-off payment order.
    Order(String),
    /// A recurring provider subscription.
    Subscription(String),
}

impl ProviderRef {
    /// The provider-side identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Order(id) | Self::Subscription(id) => id,
        }
    }

    /// Whether this reference points at a recurring provider subscription.
    #[must_use]
    pub fn is_subscription(&self) -> bool {
        matches!(self, Self::Subscription(_))
    }
}

/// A recurring-payment mandate held at a gateway.
///
/// Mandate identifiers are meaningless outside their gateway, so the
/// reference carries its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gateway", content = "id", rename_all = "snake_case")]
pub enum MandateRef {
    /// A Razorpay subscription id acting as the mandate.
    Razorpay(String),
    /// A PayPal billing-agreement id.
    Paypal(String),
}

impl MandateRef {
    /// Builds a mandate reference in the given gateway's namespace.
    #[must_use]
    pub fn new(gateway: Gateway, id: impl Into<String>) -> Self {
        match gateway {
            Gateway::Razorpay => Self::Razorpay(id.into()),
            Gateway::Paypal => Self::Paypal(id.into()),
        }
    }

    /// The gateway this mandate lives at.
    #[must_use]
    pub fn gateway(&self) -> Gateway {
        match self {
            Self::Razorpay(_) => Gateway::Razorpay,
            Self::Paypal(_) => Gateway::Paypal,
        }
    }

    /// The mandate identifier within its gateway.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Razorpay(id) | Self::Paypal(id) => id,
        }
    }
}
