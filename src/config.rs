//! Engine configuration.
//!
//! Configuration is loaded from TOML and validated before any component is
//! built from it. A minimal configuration only needs the backend base URL;
//! everything else has production defaults:
//!
//! ```toml
//! [backend]
//! base_url = "https://billing.example.com"
//!
//! [checkout]
//! default_role = "startup"
//! currency = "INR"
//! trial_days = 30
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 100
//! ```

use serde::Deserialize;
use url::Url;

use crate::catalog::UserType;
use crate::error::{EngineError, Result};
use crate::gateway::{DEFAULT_GATEWAY, Gateway};

/// Top-level configuration for the billing engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Payment backend connection settings.
    pub backend: BackendConfig,

    /// Checkout behaviour settings.
    #[serde(default)]
    pub checkout: CheckoutConfig,

    /// Retry and visibility-poll settings.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Parses and validates a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the TOML is malformed or any
    /// field fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| EngineError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the full configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.backend.validate()?;
        self.checkout.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Connection settings for the payment backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend. Must be HTTPS and must not point at a
    /// loopback address.
    pub base_url: String,

    /// Path prefix under which the payment endpoints live.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl BackendConfig {
    fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| EngineError::Config(format!("invalid backend base_url: {e}")))?;

        if url.scheme() != "https" {
            return Err(EngineError::Config(format!(
                "backend base_url must use HTTPS, got scheme '{}'",
                url.scheme()
            )));
        }

        if let Some(host) = url.host_str()
            && (host == "localhost" || host.starts_with("127.") || host == "::1")
        {
            return Err(EngineError::Config(format!(
                "backend base_url must not point at a loopback address: {host}"
            )));
        }

        if !self.api_prefix.is_empty() && !self.api_prefix.starts_with('/') {
            return Err(EngineError::Config(format!(
                "api_prefix must start with '/', got '{}'",
                self.api_prefix
            )));
        }

        if self.timeout_secs == 0 {
            return Err(EngineError::Config(
                "backend timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Checkout behaviour settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutConfig {
    /// Role used when a user holds no identity matching the requested plan.
    #[serde(default = "default_role")]
    pub default_role: UserType,

    /// Gateway used when the checkout context carries no routing signal.
    #[serde(default = "default_gateway")]
    pub default_gateway: Gateway,

    /// ISO 4217 currency code sent with order creation.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Prefix for generated order receipts.
    #[serde(default = "default_receipt_prefix")]
    pub receipt_prefix: String,

    /// Trial length in days for newly started trials.
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,

    /// Capacity of the verified-payment cache that makes verification
    /// idempotent.
    #[serde(default = "default_verified_cache_capacity")]
    pub verified_cache_capacity: usize,

    /// Buffer size of the payment-success broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl CheckoutConfig {
    fn validate(&self) -> Result<()> {
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(EngineError::Config(format!(
                "currency must be a 3-letter uppercase ISO 4217 code, got '{}'",
                self.currency
            )));
        }

        // Receipts are capped at 40 characters downstream; a short prefix
        // leaves room for the unique part.
        if self.receipt_prefix.is_empty() || self.receipt_prefix.len() > 8 {
            return Err(EngineError::Config(format!(
                "receipt_prefix must be 1-8 characters, got '{}'",
                self.receipt_prefix
            )));
        }
        if !self
            .receipt_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(EngineError::Config(format!(
                "receipt_prefix must be alphanumeric, got '{}'",
                self.receipt_prefix
            )));
        }

        if self.trial_days == 0 {
            return Err(EngineError::Config(
                "trial_days must be at least 1".to_string(),
            ));
        }

        if self.verified_cache_capacity == 0 {
            return Err(EngineError::Config(
                "verified_cache_capacity must be at least 1".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(EngineError::Config(
                "event_buffer must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            default_role: default_role(),
            default_gateway: default_gateway(),
            currency: default_currency(),
            receipt_prefix: default_receipt_prefix(),
            trial_days: default_trial_days(),
            verified_cache_capacity: default_verified_cache_capacity(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Retry and visibility-poll settings.
///
/// Converted into a [`RetryPolicy`](crate::reliability::RetryPolicy) by the
/// components that poll the backend or the subscription store.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(EngineError::Config(format!(
                "retry max_delay_ms ({}) must not be below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "retry backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_api_prefix() -> String {
    "/api/payments".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_role() -> UserType {
    UserType::Startup
}

fn default_gateway() -> Gateway {
    DEFAULT_GATEWAY
}

fn default_currency() -> String {
    crate::catalog::DEFAULT_CURRENCY.to_string()
}

fn default_receipt_prefix() -> String {
    "ord".to_string()
}

fn default_trial_days() -> u32 {
    30
}

fn default_verified_cache_capacity() -> usize {
    1024
}

fn default_event_buffer() -> usize {
    32
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
