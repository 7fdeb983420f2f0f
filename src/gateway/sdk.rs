//! Gateway client seam and the process-wide SDK loader.
//!
//! Provider SDKs are expensive to initialize and must not be loaded once
//! per checkout. [`SdkLoader`] keeps one load-once slot per gateway;
//! concurrent checkouts for the same gateway share a single in-flight
//! load, and a failed load leaves the slot empty so the next checkout
//! retries from scratch.

use std::sync::LazyLock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Gateway, ProviderRef};
use crate::error::{EngineError, Result};
use crate::gateway::response::GatewayResponse;

/// Everything the payment surface needs to show and collect a payment.
#[derive(Debug, Clone)]
pub struct PaymentPrompt {
    /// Checkout session this prompt belongs to.
    pub session_id: Uuid,
    /// Paying user.
    pub user_id: String,
    /// Plan name shown on the surface.
    pub plan_name: String,
    /// Final payable amount, tax included.
    pub amount: Decimal,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Provider order or subscription being paid.
    pub reference: ProviderRef,
    /// Whether the surface should set up a recurring mandate.
    pub autopay: bool,
}

/// What the user did with the payment surface.
#[derive(Debug, Clone)]
pub enum UserAction {
    /// The user paid; the gateway handed back its success payload.
    Completed(GatewayResponse),
    /// The user closed the surface without paying.
    Dismissed,
}

/// Client-side integration with one gateway's SDK.
///
/// Implementations wrap whatever environment actually hosts the provider
/// script. The engine only ever drives this seam; tests substitute
/// scripted implementations.
#[async_trait]
pub trait GatewayClient: Send + Sync + std::fmt::Debug {
    /// Which gateway this client drives.
    fn gateway(&self) -> Gateway;

    /// Loads the provider script into the client environment.
    ///
    /// Called at most once per process per gateway via [`SdkLoader`].
    async fn load(&self) -> Result<()>;

    /// Presents the payment surface and waits for the user to act.
    async fn collect(&self, prompt: PaymentPrompt) -> Result<UserAction>;

    /// Tears the payment surface down after a dismissal.
    async fn dismiss(&self);
}

static GLOBAL_SDK_LOADER: LazyLock<SdkLoader> = LazyLock::new(SdkLoader::new);

/// Process-wide, load-once tracker for gateway SDKs.
#[derive(Debug, Default)]
pub struct SdkLoader {
    razorpay: OnceCell<()>,
    paypal: OnceCell<()>,
}

impl SdkLoader {
    /// Creates an isolated loader. Most callers want [`SdkLoader::global`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The loader shared by every checkout in this process.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_SDK_LOADER
    }

    fn cell(&self, gateway: Gateway) -> &OnceCell<()> {
        match gateway {
            Gateway::Razorpay => &self.razorpay,
            Gateway::Paypal => &self.paypal,
        }
    }

    /// Whether the SDK for a gateway has finished loading.
    #[must_use]
    pub fn is_loaded(&self, gateway: Gateway) -> bool {
        self.cell(gateway).initialized()
    }

    /// Ensures the client's gateway SDK is loaded, loading at most once.
    ///
    /// Concurrent callers for the same gateway await one shared load. On
    /// failure the slot stays uninitialized, so the load is retried by
    /// whichever checkout comes next.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::GatewayLoad`] when the underlying load
    /// fails.
    #[instrument(skip(self, client), fields(gateway = %client.gateway()))]
    pub async fn ensure_loaded(&self, client: &dyn GatewayClient) -> Result<()> {
        let cell = self.cell(client.gateway());
        if cell.initialized() {
            debug!("gateway SDK already loaded");
            return Ok(());
        }

        cell.get_or_try_init(|| async {
            info!("loading gateway SDK");
            client.load().await.map_err(|error| match error {
                already @ EngineError::GatewayLoad(_) => already,
                other => EngineError::GatewayLoad(other.to_string()),
            })
        })
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Debug)]
    struct ScriptedClient {
        gateway: Gateway,
        loads: AtomicU32,
        failures_remaining: AtomicU32,
    }

    impl ScriptedClient {
        fn new(gateway: Gateway) -> Self {
            Self {
                gateway,
                loads: AtomicU32::new(0),
                failures_remaining: AtomicU32::new(0),
            }
        }

        fn failing_first(gateway: Gateway, failures: u32) -> Self {
            Self {
                gateway,
                loads: AtomicU32::new(0),
                failures_remaining: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl GatewayClient for ScriptedClient {
        fn gateway(&self) -> Gateway {
            self.gateway
        }

        async fn load(&self) -> Result<()> {
            // Slow enough that concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.loads.fetch_add(1, Ordering::SeqCst);

            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::GatewayLoad("script unavailable".to_string()));
            }
            Ok(())
        }

        async fn collect(&self, _prompt: PaymentPrompt) -> Result<UserAction> {
            Ok(UserAction::Dismissed)
        }

        async fn dismiss(&self) {}
    }

    #[tokio::test]
    async fn test_load_happens_once() {
        let loader = SdkLoader::new();
        let client = ScriptedClient::new(Gateway::Razorpay);

        loader.ensure_loaded(&client).await.unwrap();
        loader.ensure_loaded(&client).await.unwrap();
        loader.ensure_loaded(&client).await.unwrap();

        assert_eq!(client.loads.load(Ordering::SeqCst), 1);
        assert!(loader.is_loaded(Gateway::Razorpay));
        assert!(!loader.is_loaded(Gateway::Paypal));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkouts_share_one_load() {
        let loader = Arc::new(SdkLoader::new());
        let client = Arc::new(ScriptedClient::new(Gateway::Paypal));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = Arc::clone(&loader);
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                loader.ensure_loaded(client.as_ref()).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(client.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_slot_empty_for_retry() {
        let loader = SdkLoader::new();
        let client = ScriptedClient::failing_first(Gateway::Razorpay, 1);

        let error = loader.ensure_loaded(&client).await.unwrap_err();
        assert!(matches!(error, EngineError::GatewayLoad(_)));
        assert!(!loader.is_loaded(Gateway::Razorpay));

        // Second attempt runs the load again and succeeds.
        loader.ensure_loaded(&client).await.unwrap();
        assert_eq!(client.loads.load(Ordering::SeqCst), 2);
        assert!(loader.is_loaded(Gateway::Razorpay));
    }

    #[tokio::test]
    async fn test_gateways_load_independently() {
        let loader = SdkLoader::new();
        let razorpay = ScriptedClient::new(Gateway::Razorpay);
        let paypal = ScriptedClient::new(Gateway::Paypal);

        loader.ensure_loaded(&razorpay).await.unwrap();
        assert!(loader.is_loaded(Gateway::Razorpay));
        assert!(!loader.is_loaded(Gateway::Paypal));

        loader.ensure_loaded(&paypal).await.unwrap();
        assert!(loader.is_loaded(Gateway::Paypal));
        assert_eq!(razorpay.loads.load(Ordering::SeqCst), 1);
        assert_eq!(paypal.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_loader_is_a_singleton() {
        assert!(std::ptr::eq(SdkLoader::global(), SdkLoader::global()));
    }
}
