//! HTTPS implementation of the payment backend.
//!
//! One pooled client is built per backend instance to avoid per-request
//! connection setup. Endpoint paths are fixed; the host and prefix come
//! from [`BackendConfig`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument};
use url::Url;

use super::{
    CreateOrderRequest, CreateOrderResponse, CreateSubscriptionRequest,
    CreateSubscriptionResponse, CreateTrialRequest, CreateTrialResponse, PaymentBackend,
    VerifyPaymentRequest, VerifyPaymentResponse,
};
use crate::config::BackendConfig;
use crate::error::{EngineError, Result};

const ORDER_PATH: &str = "/create-order";
const SUBSCRIPTION_PATH: &str = "/create-subscription";
const TRIAL_PATH: &str = "/create-trial-subscription";
const VERIFY_PATH: &str = "/verify";

/// Characters of a failed response body kept in error messages.
const ERROR_SNIPPET_LENGTH: usize = 200;

/// Creates a configured HTTP client with connection pooling.
///
/// Configuration:
/// - Connection timeout: 10 seconds
/// - Total timeout: from the backend configuration
/// - Connection pool: max 10 idle connections per host
///
/// # Errors
///
/// Returns error if client configuration fails.
fn create_backend_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(10)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(EngineError::Http)
}

/// Creation endpoints reject with [`EngineError::OrderCreation`].
fn reject_creation(error: EngineError) -> EngineError {
    match error {
        EngineError::Backend(detail) => EngineError::OrderCreation(detail),
        other => other,
    }
}

/// The verify endpoint rejects with [`EngineError::Verification`].
fn reject_verification(error: EngineError) -> EngineError {
    match error {
        EngineError::Backend(detail) => EngineError::Verification(detail),
        other => other,
    }
}

/// [`PaymentBackend`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpPaymentBackend {
    client: Client,
    base_url: Url,
    api_prefix: String,
}

impl HttpPaymentBackend {
    /// Builds a backend from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an unparseable base URL and
    /// [`EngineError::Http`] if the client cannot be constructed.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| EngineError::Config(format!("invalid backend base_url: {e}")))?;
        let client = create_backend_client(Duration::from_secs(config.timeout_secs))?;

        Ok(Self {
            client,
            base_url,
            api_prefix: config.api_prefix.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.api_prefix,
            path
        )
    }

    #[instrument(skip(self, body))]
    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(ERROR_SNIPPET_LENGTH).collect();
            return Err(EngineError::Backend(format!(
                "backend returned status {status}: {snippet}"
            )));
        }

        let bytes = response.bytes().await.map_err(EngineError::Http)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Backend(format!("response parse failed: {e}")))
    }
}

#[async_trait]
impl PaymentBackend for HttpPaymentBackend {
    async fn create_order(&self, request: CreateOrderRequest) -> Result<CreateOrderResponse> {
        info!(
            amount_minor = request.amount_minor,
            currency = %request.currency,
            receipt = %request.receipt,
            "creating payment order"
        );
        self.post_json(ORDER_PATH, &request)
            .await
            .map_err(reject_creation)
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse> {
        info!(
            user_id = %request.user_id,
            plan_name = %request.plan_name,
            interval = %request.interval,
            "creating provider subscription"
        );
        self.post_json(SUBSCRIPTION_PATH, &request)
            .await
            .map_err(reject_creation)
    }

    async fn create_trial_subscription(
        &self,
        request: CreateTrialRequest,
    ) -> Result<CreateTrialResponse> {
        info!(
            user_id = %request.user_id,
            plan_name = %request.plan_name,
            trial_days = request.trial_days,
            "creating trial subscription"
        );
        self.post_json(TRIAL_PATH, &request)
            .await
            .map_err(reject_creation)
    }

    async fn verify(&self, request: VerifyPaymentRequest) -> Result<VerifyPaymentResponse> {
        info!(
            payment_id = %request.payment_id,
            user_id = %request.user_id,
            "verifying captured payment"
        );
        self.post_json(VERIFY_PATH, &request)
            .await
            .map_err(reject_verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackendConfig {
        BackendConfig {
            base_url: "https://billing.example.com".to_string(),
            api_prefix: "/api/payments".to_string(),
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_backend_builds_from_config() {
        assert!(HttpPaymentBackend::new(&config()).is_ok());
    }

    #[test]
    fn test_endpoint_joins_host_prefix_and_path() {
        let backend = HttpPaymentBackend::new(&config()).unwrap();
        assert_eq!(
            backend.endpoint(ORDER_PATH),
            "https://billing.example.com/api/payments/create-order"
        );
        assert_eq!(
            backend.endpoint(VERIFY_PATH),
            "https://billing.example.com/api/payments/verify"
        );
    }

    #[test]
    fn test_endpoint_with_empty_prefix() {
        let mut bare = config();
        bare.api_prefix = String::new();
        let backend = HttpPaymentBackend::new(&bare).unwrap();
        assert_eq!(
            backend.endpoint(TRIAL_PATH),
            "https://billing.example.com/create-trial-subscription"
        );
    }

    #[test]
    fn test_creation_rejections_become_order_creation_errors() {
        let mapped = reject_creation(EngineError::Backend("status 422".to_string()));
        assert!(matches!(mapped, EngineError::OrderCreation(_)));

        // Transport errors keep their identity for retry classification.
        let passthrough = reject_creation(EngineError::InvalidInput("x".to_string()));
        assert!(matches!(passthrough, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_verify_rejections_become_verification_errors() {
        let mapped = reject_verification(EngineError::Backend("status 400".to_string()));
        assert!(matches!(mapped, EngineError::Verification(_)));
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let mut bad = config();
        bad.base_url = "not a url".to_string();
        assert!(HttpPaymentBackend::new(&bad).is_err());
    }
}
