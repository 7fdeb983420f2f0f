//! Checkout orchestration.
//!
//! One [`CheckoutOrchestrator::checkout`] call drives a whole purchase:
//! quote the price (coupon, then tax), pick the gateway once, load its
//! SDK at most once per process, create the provider-side order or
//! subscription, hand the widget to the user, verify the payment and
//! land the subscription in the ledger, then broadcast the success
//! event. The user can walk away at exactly one point, the widget, and
//! doing so tears the widget down and ends the checkout without
//! touching the ledger.
//!
//! The in-flight attempt is a [`CheckoutSession`] moving through
//! typestate phases; transitions consume the session, so reporting a
//! terminal outcome twice does not compile. Each `checkout()` call
//! returns its own [`CheckoutOutcome`], so concurrent checkouts never
//! share completion state.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::backend::{CreateOrderRequest, CreateSubscriptionRequest, PaymentBackend, make_receipt};
use crate::catalog::{PlanCatalog, PlanId, SubscriptionPlan};
use crate::config::{CheckoutConfig, RetryConfig};
use crate::error::{EngineError, Result};
use crate::gateway::sdk::{GatewayClient, PaymentPrompt, SdkLoader, UserAction};
use crate::gateway::{Gateway, ProviderRef, select_gateway};
use crate::ledger::{SubscriptionLedger, SubscriptionStore, TrialManager, UserSubscription};
use crate::pricing::{Coupon, CouponEngine, CouponStore, TaxBreakdown};
use crate::reliability::RetryPolicy;

pub mod events;
pub mod verify;

pub use events::{CheckoutEvents, PaymentSucceeded};
pub use verify::{PaymentVerifier, VerificationContext};

/// Runtime name of a checkout phase, for logs and outcome reporting.
///
/// Compile-time phase tracking lives in [`phase`]; this enum is the
/// human-readable mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutPhase {
    /// Session opened, nothing external touched yet.
    Idle,
    /// Gateway SDK is loaded and ready.
    SdkReady,
    /// Provider-side order or subscription exists.
    OrderCreated,
    /// Widget shown, blocked on the user.
    AwaitingUser,
    /// Provider response handed to the verifier.
    Verifying,
    /// Terminal: paid and persisted.
    Complete,
    /// Terminal: an error ended the attempt.
    Failed,
    /// Terminal: the user dismissed the widget.
    Cancelled,
}

impl CheckoutPhase {
    /// Returns the log-format name of this phase.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SdkReady => "sdk_ready",
            Self::OrderCreated => "order_created",
            Self::AwaitingUser => "awaiting_user",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CheckoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typestate markers for [`CheckoutSession`].
pub mod phase {
    /// Session opened.
    #[derive(Debug)]
    pub struct Idle;
    /// SDK loaded.
    #[derive(Debug)]
    pub struct SdkReady;
    /// Provider order or subscription created.
    #[derive(Debug)]
    pub struct OrderCreated;
    /// Waiting on the user.
    #[derive(Debug)]
    pub struct AwaitingUser;
    /// Payment collected, being verified.
    #[derive(Debug)]
    pub struct Verifying;
}

/// The in-flight state of one checkout attempt. Never persisted.
///
/// The phase parameter only permits the legal transitions, and every
/// transition consumes the session, so a finished checkout cannot be
/// finished again.
#[derive(Debug)]
pub struct CheckoutSession<P> {
    id: Uuid,
    gateway: Gateway,
    total: Decimal,
    _phase: PhantomData<P>,
}

impl<P> CheckoutSession<P> {
    /// Unique id of this attempt.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The gateway captured when the session opened.
    ///
    /// Selection happens exactly once per attempt; everything downstream
    /// reads it from here instead of re-deriving it.
    #[must_use]
    pub fn gateway(&self) -> Gateway {
        self.gateway
    }

    /// Final payable amount for this attempt, tax included.
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.total
    }

    fn advance<Q>(self, next: CheckoutPhase) -> CheckoutSession<Q> {
        debug!(session_id = %self.id, phase = %next, "checkout phase");
        CheckoutSession {
            id: self.id,
            gateway: self.gateway,
            total: self.total,
            _phase: PhantomData,
        }
    }
}

impl CheckoutSession<phase::Idle> {
    /// Opens a session with the gateway and total captured for its
    /// lifetime.
    #[must_use]
    pub fn begin(gateway: Gateway, total: Decimal) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, gateway = %gateway, total = %total, "checkout session opened");
        Self {
            id,
            gateway,
            total,
            _phase: PhantomData,
        }
    }

    /// The gateway SDK finished loading.
    #[must_use]
    pub fn script_loaded(self) -> CheckoutSession<phase::SdkReady> {
        self.advance(CheckoutPhase::SdkReady)
    }

    /// Completes a fully discounted checkout that never left `Idle`.
    #[must_use]
    pub fn complete_free(self, subscription: UserSubscription) -> CheckoutOutcome {
        debug!(session_id = %self.id, phase = %CheckoutPhase::Complete, "checkout phase");
        CheckoutOutcome::Completed {
            session_id: self.id,
            amount_charged: Decimal::ZERO,
            subscription,
        }
    }
}

impl CheckoutSession<phase::SdkReady> {
    /// The provider-side order or subscription was created.
    #[must_use]
    pub fn order_created(self) -> CheckoutSession<phase::OrderCreated> {
        self.advance(CheckoutPhase::OrderCreated)
    }
}

impl CheckoutSession<phase::OrderCreated> {
    /// The widget is up and the user holds the next move.
    #[must_use]
    pub fn awaiting_user(self) -> CheckoutSession<phase::AwaitingUser> {
        self.advance(CheckoutPhase::AwaitingUser)
    }
}

impl CheckoutSession<phase::AwaitingUser> {
    /// The user paid; the response goes to verification.
    #[must_use]
    pub fn collected(self) -> CheckoutSession<phase::Verifying> {
        self.advance(CheckoutPhase::Verifying)
    }

    /// The user dismissed the widget.
    #[must_use]
    pub fn cancelled(self) -> CheckoutOutcome {
        debug!(session_id = %self.id, phase = %CheckoutPhase::Cancelled, "checkout phase");
        CheckoutOutcome::Cancelled {
            session_id: self.id,
        }
    }
}

impl CheckoutSession<phase::Verifying> {
    /// Verification succeeded and the subscription is persisted.
    #[must_use]
    pub fn complete(self, subscription: UserSubscription) -> CheckoutOutcome {
        debug!(session_id = %self.id, phase = %CheckoutPhase::Complete, "checkout phase");
        CheckoutOutcome::Completed {
            session_id: self.id,
            amount_charged: self.total,
            subscription,
        }
    }
}

/// A purchase request from the caller's surface.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// The purchasing user.
    pub user_id: String,
    /// Plan to purchase.
    pub plan_id: PlanId,
    /// Coupon code entered by the user, if any.
    pub coupon_code: Option<String>,
    /// Country the purchase is made from; falls back to the plan's
    /// country scope for gateway selection.
    pub country: Option<String>,
    /// Whether to set up recurring billing with a mandate.
    pub autopay: bool,
}

impl CheckoutRequest {
    /// Creates a one-time purchase request.
    #[must_use]
    pub fn new(user_id: impl Into<String>, plan_id: PlanId) -> Self {
        Self {
            user_id: user_id.into(),
            plan_id,
            coupon_code: None,
            country: None,
            autopay: false,
        }
    }

    /// Applies a coupon code.
    #[must_use]
    pub fn with_coupon(mut self, code: impl Into<String>) -> Self {
        self.coupon_code = Some(code.into());
        self
    }

    /// Sets the purchase country.
    #[must_use]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Enables or disables recurring billing.
    #[must_use]
    pub fn with_autopay(mut self, autopay: bool) -> Self {
        self.autopay = autopay;
        self
    }
}

/// The price of one checkout attempt, computed once per attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PriceQuote {
    /// Plan price before discount and tax.
    pub base_price: Decimal,
    /// Base after the coupon, before tax.
    pub discounted: Decimal,
    /// The coupon that was applied, if one validated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon: Option<Coupon>,
    /// A coupon code the user entered that did not validate. The
    /// checkout proceeds undiscounted; surfaces show this to the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_coupon: Option<String>,
    /// Currency the attempt bills in.
    pub currency: String,
    /// Tax on the discounted base.
    pub tax: TaxBreakdown,
    /// Final payable amount.
    pub total: Decimal,
}

impl PriceQuote {
    /// Whether this attempt costs nothing and can skip the gateway.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.total <= Decimal::ZERO
    }
}

/// How a checkout attempt ended.
#[derive(Debug)]
pub enum CheckoutOutcome {
    /// Payment verified and the subscription activated.
    Completed {
        /// The attempt that completed.
        session_id: Uuid,
        /// Amount actually charged; zero for fully discounted checkouts.
        amount_charged: Decimal,
        /// The activated subscription row.
        subscription: UserSubscription,
    },
    /// The user dismissed the widget; nothing was charged or written.
    Cancelled {
        /// The attempt that was abandoned.
        session_id: Uuid,
    },
}

impl CheckoutOutcome {
    /// Whether the user walked away.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The activated subscription, when the attempt completed.
    #[must_use]
    pub fn subscription(&self) -> Option<&UserSubscription> {
        match self {
            Self::Completed { subscription, .. } => Some(subscription),
            Self::Cancelled { .. } => None,
        }
    }
}

/// One client per gateway the engine can route to.
#[derive(Debug, Clone)]
pub struct GatewayClients {
    /// Razorpay widget integration.
    pub razorpay: Arc<dyn GatewayClient>,
    /// PayPal widget integration.
    pub paypal: Arc<dyn GatewayClient>,
}

impl GatewayClients {
    /// Bundles the two gateway clients.
    #[must_use]
    pub fn new(razorpay: Arc<dyn GatewayClient>, paypal: Arc<dyn GatewayClient>) -> Self {
        Self { razorpay, paypal }
    }

    /// The client for a selected gateway.
    #[must_use]
    pub fn client_for(&self, gateway: Gateway) -> &Arc<dyn GatewayClient> {
        match gateway {
            Gateway::Razorpay => &self.razorpay,
            Gateway::Paypal => &self.paypal,
        }
    }
}

/// Drives checkouts end to end.
///
/// Owns the whole engine wiring: catalog, pricing, ledger, verifier,
/// trial manager and event hub. Embedders construct one orchestrator
/// per process and call [`CheckoutOrchestrator::checkout`] per purchase.
#[derive(Debug)]
pub struct CheckoutOrchestrator {
    catalog: PlanCatalog,
    backend: Arc<dyn PaymentBackend>,
    clients: GatewayClients,
    coupons: CouponEngine,
    ledger: SubscriptionLedger,
    trials: TrialManager,
    verifier: PaymentVerifier,
    events: CheckoutEvents,
    loader: &'static SdkLoader,
    config: CheckoutConfig,
}

impl CheckoutOrchestrator {
    /// Wires up the engine.
    ///
    /// The orchestrator builds the coupon engine, ledger, verifier and
    /// trial manager over the given stores so every component shares one
    /// view of the data.
    #[must_use]
    pub fn new(
        catalog: PlanCatalog,
        backend: Arc<dyn PaymentBackend>,
        subscriptions: Arc<dyn SubscriptionStore>,
        coupons: Arc<dyn CouponStore>,
        clients: GatewayClients,
        config: CheckoutConfig,
        retry: RetryConfig,
    ) -> Self {
        let coupon_engine = CouponEngine::new(coupons);
        let ledger = SubscriptionLedger::new(
            Arc::clone(&subscriptions),
            coupon_engine.clone(),
            config.default_role,
        )
        .with_default_currency(config.currency.clone());
        let verifier = PaymentVerifier::new(
            Arc::clone(&backend),
            ledger.clone(),
            config.verified_cache_capacity,
            RetryPolicy::from_config(&retry),
        );
        let trials = TrialManager::new(
            ledger.clone(),
            Arc::clone(&backend),
            config.trial_days,
            config.default_gateway,
        );
        let events = CheckoutEvents::new(config.event_buffer);

        Self {
            catalog,
            backend,
            clients,
            coupons: coupon_engine,
            ledger,
            trials,
            verifier,
            events,
            loader: SdkLoader::global(),
            config,
        }
    }

    /// Replaces the process-wide SDK loader, mainly for tests that need
    /// load-state isolation.
    #[must_use]
    pub fn with_sdk_loader(mut self, loader: &'static SdkLoader) -> Self {
        self.loader = loader;
        self
    }

    /// The event hub successful checkouts publish to.
    #[must_use]
    pub fn events(&self) -> &CheckoutEvents {
        &self.events
    }

    /// The subscription ledger behind this orchestrator.
    #[must_use]
    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// The trial manager sharing this orchestrator's ledger and backend.
    #[must_use]
    pub fn trials(&self) -> &TrialManager {
        &self.trials
    }

    /// The plan catalog.
    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Prices one checkout attempt: coupon first, then tax.
    ///
    /// A coupon that fails validation never aborts the quote; the code
    /// comes back in [`PriceQuote::rejected_coupon`] and the price stays
    /// undiscounted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if the validated coupon's
    /// discount turns out to be malformed, or if the tax math overflows.
    pub async fn quote(
        &self,
        plan: &SubscriptionPlan,
        coupon_code: Option<&str>,
    ) -> Result<PriceQuote> {
        let mut coupon = None;
        let mut rejected_coupon = None;
        if let Some(code) = coupon_code {
            match self.coupons.validate(code, plan.user_type).await {
                Some(valid) => coupon = Some(valid),
                None => rejected_coupon = Some(code.trim().to_string()),
            }
        }

        let discounted = match &coupon {
            Some(coupon) => coupon.apply(plan.base_price)?,
            None => plan.base_price,
        };
        let tax = TaxBreakdown::compute(discounted, plan.tax_percentage)?;
        let total = tax.total;

        Ok(PriceQuote {
            base_price: plan.base_price,
            discounted,
            coupon,
            rejected_coupon,
            currency: plan.currency_or(&self.config.currency).to_string(),
            tax,
            total,
        })
    }

    /// Runs one checkout attempt to a terminal outcome.
    ///
    /// Returns `Ok(Completed)` once the payment is verified and the
    /// subscription persisted, or `Ok(Cancelled)` when the user
    /// dismissed the widget. Every completed checkout, paid or free,
    /// publishes exactly one [`PaymentSucceeded`] event.
    ///
    /// The call suspends while the user holds the widget and does not
    /// time out on its own; callers own timeout and cancellation.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidInput`] for an unknown or retired plan,
    /// [`EngineError::GatewayLoad`] when the SDK cannot load,
    /// [`EngineError::OrderCreation`] when the backend rejects the
    /// order, [`EngineError::Verification`] when the payment cannot be
    /// confirmed, and [`EngineError::SubscriptionPersist`] when the
    /// ledger write fails after the charge.
    #[instrument(
        skip(self, request),
        fields(user_id = %request.user_id, plan_id = %request.plan_id)
    )]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutOutcome> {
        let Some(plan) = self.catalog.get(&request.plan_id) else {
            return Err(EngineError::InvalidInput(format!(
                "unknown plan '{}'",
                request.plan_id
            )));
        };
        if !plan.active {
            return Err(EngineError::InvalidInput(format!(
                "plan '{}' is not currently purchasable",
                request.plan_id
            )));
        }

        let quote = self.quote(plan, request.coupon_code.as_deref()).await?;
        let country = request.country.as_deref().or(plan.country.as_deref());
        let gateway = select_gateway(country, self.config.default_gateway);
        let session = CheckoutSession::begin(gateway, quote.total);
        info!(
            session_id = %session.id(),
            gateway = %gateway,
            total = %quote.total,
            autopay = request.autopay,
            "checkout started"
        );

        if quote.is_free() {
            return self.complete_free(session, plan, &request, &quote).await;
        }

        let client = self.clients.client_for(gateway);
        self.loader.ensure_loaded(client.as_ref()).await?;
        let session = session.script_loaded();

        let reference = self.create_reference(plan, &request, &quote).await?;
        let session = session.order_created();

        let prompt = PaymentPrompt {
            session_id: session.id(),
            user_id: request.user_id.clone(),
            plan_name: plan.name.clone(),
            amount: quote.total,
            currency: quote.currency.clone(),
            reference,
            autopay: request.autopay,
        };
        let session = session.awaiting_user();

        let action = match client.collect(prompt).await {
            Ok(action) => action,
            Err(EngineError::UserCancelled) => UserAction::Dismissed,
            Err(error) => return Err(error),
        };

        let response = match action {
            UserAction::Completed(response) => response,
            UserAction::Dismissed => {
                client.dismiss().await;
                info!(session_id = %session.id(), "checkout cancelled by user");
                return Ok(session.cancelled());
            }
        };

        if response.gateway() != gateway {
            return Err(EngineError::Verification(format!(
                "payment response came from {} but the session was routed to {gateway}",
                response.gateway()
            )));
        }
        let session = session.collected();

        let subscription = self
            .verifier
            .verify(VerificationContext {
                response: &response,
                user_id: &request.user_id,
                plan,
                coupon: quote.coupon.as_ref(),
                amount: quote.discounted,
                tax: &quote.tax,
                gateway,
                autopay: request.autopay,
                country,
            })
            .await?;

        self.events.publish_success(PaymentSucceeded {
            user_id: request.user_id.clone(),
            plan_id: plan.id.clone(),
            subscription_id: subscription.id.clone(),
            amount: subscription.total_amount,
            occurred_at: Utc::now(),
        });
        info!(
            session_id = %session.id(),
            subscription_id = %subscription.id,
            "checkout complete"
        );
        Ok(session.complete(subscription))
    }

    /// Lands a fully discounted checkout straight in the ledger.
    ///
    /// No gateway is involved, so there is no payment to verify; the
    /// atomic coupon redemption inside the upsert is what keeps a capped
    /// coupon from overselling on this path.
    async fn complete_free(
        &self,
        session: CheckoutSession<phase::Idle>,
        plan: &SubscriptionPlan,
        request: &CheckoutRequest,
        quote: &PriceQuote,
    ) -> Result<CheckoutOutcome> {
        info!(session_id = %session.id(), "fully discounted checkout, skipping gateway");

        let subscription = self
            .ledger
            .upsert(
                plan,
                &request.user_id,
                quote.coupon.as_ref(),
                Some(&quote.tax),
                None,
            )
            .await?;

        self.events.publish_success(PaymentSucceeded {
            user_id: request.user_id.clone(),
            plan_id: plan.id.clone(),
            subscription_id: subscription.id.clone(),
            amount: Decimal::ZERO,
            occurred_at: Utc::now(),
        });
        info!(
            session_id = %session.id(),
            subscription_id = %subscription.id,
            "checkout complete"
        );
        Ok(session.complete_free(subscription))
    }

    /// Creates the provider-side charge target for a paid attempt.
    async fn create_reference(
        &self,
        plan: &SubscriptionPlan,
        request: &CheckoutRequest,
        quote: &PriceQuote,
    ) -> Result<ProviderRef> {
        if request.autopay {
            let create = CreateSubscriptionRequest {
                user_id: request.user_id.clone(),
                plan_name: plan.name.clone(),
                amount: quote.total,
                interval: plan.interval,
            };
            let response = self.backend.create_subscription(create).await?;
            info!(subscription_id = %response.subscription_id, "provider subscription created");
            Ok(ProviderRef::Subscription(response.subscription_id))
        } else {
            let receipt = make_receipt(&self.config.receipt_prefix);
            let create = CreateOrderRequest::new(quote.total, &quote.currency, &receipt)?;
            let response = self.backend.create_order(create).await?;
            info!(order_id = %response.order_id, "provider order created");
            Ok(ProviderRef::Order(response.order_id))
        }
    }
}
