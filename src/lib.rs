//! Billing Orchestrator
//!
//! A subscription and payment orchestration engine: plan catalog,
//! coupon and tax pricing, gateway-routed checkout, payment
//! verification, trials with autopay mandates, and a subscription
//! ledger with a single-active-row guarantee per billing identity.
//!
//! # Overview
//!
//! One [`CheckoutOrchestrator`] owns the whole flow. A checkout call
//! quotes the price (coupon first, then tax on the discounted base),
//! routes to Razorpay or PayPal by country, loads the gateway SDK at
//! most once per process, creates the provider-side order or
//! subscription, waits on the user, verifies the payment against the
//! backend, lands exactly one active subscription row, and broadcasts
//! a success event. Fully discounted checkouts skip the gateway
//! entirely; a dismissed widget ends the attempt without touching the
//! ledger.
//!
//! Verification is idempotent per gateway payment id, even for
//! duplicates that race: a retried or concurrent success callback
//! replays the stored subscription instead of writing its own. Coupon
//! redemptions are capped atomically, which holds under concurrent
//! checkouts racing for the last redemption.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use billing_orchestrator::backend::HttpPaymentBackend;
//! use billing_orchestrator::catalog::{PlanCatalog, PlanId};
//! use billing_orchestrator::ledger::InMemorySubscriptionStore;
//! use billing_orchestrator::pricing::InMemoryCouponStore;
//! use billing_orchestrator::{
//!     CheckoutOrchestrator, CheckoutRequest, EngineConfig, GatewayClients,
//! };
//!
//! # use billing_orchestrator::Result;
//! # use billing_orchestrator::gateway::Gateway;
//! # use billing_orchestrator::gateway::sdk::{GatewayClient, PaymentPrompt, UserAction};
//! # #[derive(Debug)]
//! # struct Widget(Gateway);
//! # #[async_trait::async_trait]
//! # impl GatewayClient for Widget {
//! #     fn gateway(&self) -> Gateway { self.0 }
//! #     async fn load(&self) -> Result<()> { Ok(()) }
//! #     async fn collect(&self, _: PaymentPrompt) -> Result<UserAction> { Ok(UserAction::Dismissed) }
//! #     async fn dismiss(&self) {}
//! # }
//! # async fn example() -> Result<()> {
//! let config = EngineConfig::from_toml(
//!     r#"
//!     [backend]
//!     base_url = "https://billing.example.com"
//!     "#,
//! )?;
//! let catalog = PlanCatalog::from_toml(
//!     r#"
//!     [[plans]]
//!     id = "startup-pro-monthly"
//!     name = "Startup Pro"
//!     user_type = "startup"
//!     tier = "pro"
//!     base_price = "100.00"
//!     tax_percentage = "18"
//!     interval = "monthly"
//!     "#,
//! )?;
//!
//! // The gateway clients wrap whatever surface hosts the provider widgets.
//! let orchestrator = CheckoutOrchestrator::new(
//!     catalog,
//!     Arc::new(HttpPaymentBackend::new(&config.backend)?),
//!     Arc::new(InMemorySubscriptionStore::new()),
//!     Arc::new(InMemoryCouponStore::new()),
//!     GatewayClients::new(
//!         Arc::new(Widget(Gateway::Razorpay)),
//!         Arc::new(Widget(Gateway::Paypal)),
//!     ),
//!     config.checkout,
//!     config.retry,
//! );
//!
//! let outcome = orchestrator
//!     .checkout(
//!         CheckoutRequest::new("user-42", PlanId::new("startup-pro-monthly")?)
//!             .with_coupon("SAVE20"),
//!     )
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest"
)]

pub mod backend;
pub mod catalog;
pub mod checkout;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod pricing;
pub mod reliability;

pub use checkout::{
    CheckoutOrchestrator, CheckoutOutcome, CheckoutRequest, GatewayClients, PaymentSucceeded,
    PriceQuote,
};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
