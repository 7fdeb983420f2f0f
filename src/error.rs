//! Error types for the billing engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! [`EngineError`] as the error type. Variants fall into four broad
//! categories:
//!
//! - **Checkout-flow errors**: [`GatewayLoad`](EngineError::GatewayLoad),
//!   [`OrderCreation`](EngineError::OrderCreation),
//!   [`Verification`](EngineError::Verification),
//!   [`UserCancelled`](EngineError::UserCancelled)
//! - **Trial errors**: [`TrialAlreadyUsed`](EngineError::TrialAlreadyUsed),
//!   [`TrialAlreadyActive`](EngineError::TrialAlreadyActive)
//! - **Ledger errors**: [`SubscriptionPersist`](EngineError::SubscriptionPersist),
//!   [`CouponExhausted`](EngineError::CouponExhausted),
//!   [`IdentityNotFound`](EngineError::IdentityNotFound)
//! - **Infrastructure errors**: [`Http`](EngineError::Http),
//!   [`Backend`](EngineError::Backend), [`Config`](EngineError::Config),
//!   [`InvalidInput`](EngineError::InvalidInput)
//!
//! # Example
//!
//! ```
//! use billing_orchestrator::{EngineError, Result};
//!
//! fn require_user(user_id: &str) -> Result<()> {
//!     if user_id.is_empty() {
//!         return Err(EngineError::InvalidInput("user id is empty".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_user("user-42").is_ok());
//! assert!(require_user("").is_err());
//! ```

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the billing engine.
#[derive(Error, Debug)]
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
pub enum EngineError {
    /// The payment gateway SDK could not be loaded.
    ///
    /// Raised when the provider's client script fails to initialize. The
    /// shared loader leaves the slot empty on failure, so a later checkout
    /// retries the load from scratch.
    ///
    /// # Recovery
    ///
    /// Transient: retry the checkout. Persistent failures usually mean the
    /// gateway is unreachable from the client environment.
    #[error("gateway SDK failed to load: {0}")]
    GatewayLoad(String),

    /// The backend rejected an order or provider-subscription creation call.
    ///
    /// # Recovery
    ///
    /// Transient when caused by timeouts or 5xx responses: retry the
    /// checkout. A 4xx rejection means the request itself is wrong and
    /// retrying will not help.
    #[error("order creation rejected: {0}")]
    OrderCreation(String),

    /// The payment could not be confirmed.
    ///
    /// The backend's independent verification of the gateway response did
    /// not succeed. The payment is treated as not having happened and no
    /// ledger write is performed.
    ///
    /// # Recovery
    ///
    /// Not retryable with the same gateway response. The user must complete
    /// a fresh checkout.
    #[error("payment could not be confirmed: {0}")]
    Verification(String),

    /// The user dismissed the payment surface without paying.
    ///
    /// This is a normal outcome of a checkout, not a fault. The orchestrator
    /// converts it into a cancelled outcome rather than surfacing it to
    /// callers; it only escapes when a gateway client is driven directly.
    #[error("checkout cancelled by user")]
    UserCancelled,

    /// The account has already consumed its one free trial.
    #[error("trial already used for this account")]
    TrialAlreadyUsed,

    /// A trial subscription is currently active for this account.
    #[error("a trial subscription is already active for this account")]
    TrialAlreadyActive,

    /// A ledger write failed after the payment had already succeeded.
    ///
    /// The money moved but the subscription record does not reflect it.
    /// This is the one failure mode that must never be dropped silently:
    /// it is logged at ERROR level where it occurs and requires manual
    /// reconciliation.
    #[error("subscription update failed after successful payment: {0}")]
    SubscriptionPersist(String),

    /// A coupon's redemption cap was reached before this redemption landed.
    #[error("coupon redemption cap reached: {0}")]
    CouponExhausted(String),

    /// No billing identity could be resolved for the user.
    #[error("no billing identity found: {0}")]
    IdentityNotFound(String),

    /// A caller-supplied value failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An HTTP request to the backend failed at the transport level.
    ///
    /// # Recovery
    ///
    /// Timeouts, connection failures and 5xx responses are transient and
    /// safe to retry with backoff.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend returned a response the engine could not use.
    ///
    /// Covers non-success status codes and payloads that fail to parse.
    #[error("invalid backend response: {0}")]
    Backend(String),

    /// The engine configuration is invalid.
    #[error("invalid engine configuration: {0}")]
    Config(String),
}
