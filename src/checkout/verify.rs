//! Server-side payment verification and the ledger handoff.
//!
//! Everything after the user pays runs through [`PaymentVerifier`]. The
//! sequencing matters: the backend confirms the charge first, then the
//! subscription row is written, then any autopay mandate is recorded.
//! A failure after the charge cleared is surfaced as
//! [`EngineError::SubscriptionPersist`] and logged at ERROR, since the
//! user has paid and the books must be reconciled.
//!
//! Verification is idempotent per gateway payment id. A duplicate
//! callback, a double-tapped confirmation, a webhook replayed after a
//! timeout, replays the original outcome instead of double-writing the
//! ledger. Duplicates that race serialize on the payment id: the first
//! confirmation lands the row, the rest wait and replay it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;

use lru::LruCache;
use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};

use crate::backend::{PaymentBackend, VerifyPaymentRequest};
use crate::catalog::SubscriptionPlan;
use crate::error::{EngineError, Result};
use crate::gateway::{Gateway, GatewayResponse};
use crate::ledger::{MandateStatus, SubscriptionId, SubscriptionLedger, UserSubscription};
use crate::pricing::{Coupon, TaxBreakdown};
use crate::reliability::{RetryPolicy, Visibility, poll_until_visible};

/// Everything the verifier needs to confirm one payment.
///
/// Borrowed from the checkout session; the verifier owns nothing about
/// the purchase except its idempotency state.
#[derive(Debug)]
pub struct VerificationContext<'a> {
    /// The raw gateway response handed back by the SDK.
    pub response: &'a GatewayResponse,
    /// The purchasing user.
    pub user_id: &'a str,
    /// The plan being paid for.
    pub plan: &'a SubscriptionPlan,
    /// Coupon applied at quote time, if any.
    pub coupon: Option<&'a Coupon>,
    /// The discounted base amount the quote charged tax on.
    pub amount: Decimal,
    /// Tax computed at quote time.
    pub tax: &'a TaxBreakdown,
    /// The gateway this checkout session went through.
    pub gateway: Gateway,
    /// Whether the purchase set up recurring billing.
    pub autopay: bool,
    /// Country the purchase was routed for.
    pub country: Option<&'a str>,
}

/// One in-flight verification slot per gateway payment id.
type PaymentLock = Arc<tokio::sync::Mutex<()>>;

/// Confirms payments against the backend and lands them in the ledger.
#[derive(Debug)]
pub struct PaymentVerifier {
    backend: Arc<dyn PaymentBackend>,
    ledger: SubscriptionLedger,
    seen: Mutex<LruCache<String, SubscriptionId>>,
    in_flight: tokio::sync::Mutex<HashMap<String, PaymentLock>>,
    policy: RetryPolicy,
}

impl PaymentVerifier {
    /// Creates a verifier.
    ///
    /// `cache_capacity` bounds the idempotency cache; `policy` drives the
    /// mandate read-back poll.
    #[must_use]
    pub fn new(
        backend: Arc<dyn PaymentBackend>,
        ledger: SubscriptionLedger,
        cache_capacity: usize,
        policy: RetryPolicy,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            ledger,
            seen: Mutex::new(LruCache::new(capacity)),
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Verifies one payment and writes the resulting subscription.
    ///
    /// Already-verified payment ids short-circuit to the row they
    /// produced the first time; duplicates still in flight wait for the
    /// first confirmation and replay its row. Otherwise the flow is:
    /// confirm the charge with the backend, upsert the subscription,
    /// record the mandate when the gateway returned one.
    ///
    /// # Errors
    ///
    /// [`EngineError::Verification`] when the backend rejects the
    /// payment (nothing is written), and
    /// [`EngineError::SubscriptionPersist`] when any write fails after
    /// the charge already cleared.
    #[instrument(
        skip(self, ctx),
        fields(payment_id = %ctx.response.payment_id(), gateway = %ctx.gateway)
    )]
    pub async fn verify(&self, ctx: VerificationContext<'_>) -> Result<UserSubscription> {
        let payment_id = ctx.response.payment_id().to_string();

        if let Some(row) = self.replay(&payment_id).await? {
            return Ok(row);
        }

        let lock = self.acquire_payment_lock(&payment_id).await;
        let held = lock.lock().await;
        let result = self.confirm_and_record(ctx, &payment_id).await;
        drop(held);
        self.release_payment_lock(&payment_id, lock).await;
        result
    }

    /// Confirms the charge and lands the row. Runs under the payment
    /// id's lock so only one confirmation per payment is ever in flight.
    async fn confirm_and_record(
        &self,
        ctx: VerificationContext<'_>,
        payment_id: &str,
    ) -> Result<UserSubscription> {
        // A racer that took the lock first has landed this payment.
        if let Some(row) = self.replay(payment_id).await? {
            return Ok(row);
        }

        let reference = ctx.response.reference()?;
        let request = VerifyPaymentRequest {
            payment_id: payment_id.to_string(),
            order_id: None,
            subscription_id: None,
            signature: ctx.response.signature().map(str::to_string),
            user_id: ctx.user_id.to_string(),
            plan_id: ctx.plan.id.clone(),
            user_type: ctx.plan.user_type,
            base_amount: ctx.amount,
            coupon_code: ctx.coupon.map(|c| c.code.clone()),
            tax: ctx.tax.clone(),
            interval: ctx.plan.interval,
            country: ctx.country.map(str::to_string),
            autopay: ctx.autopay,
        }
        .with_reference(&reference);

        let outcome = self.backend.verify(request).await?;
        if !outcome.verified {
            let detail = outcome
                .detail
                .unwrap_or_else(|| "backend rejected the payment".to_string());
            return Err(EngineError::Verification(detail));
        }
        info!("charge confirmed by backend");

        // The charge has cleared. Failures past this point must surface
        // as persist errors so the payment can be reconciled.
        let row = self
            .ledger
            .upsert(
                ctx.plan,
                ctx.user_id,
                ctx.coupon,
                Some(ctx.tax),
                Some(ctx.gateway),
            )
            .await
            .map_err(|source| {
                error!(
                    payment_id,
                    error = %source,
                    "charge cleared but the subscription write failed"
                );
                match source {
                    already @ EngineError::SubscriptionPersist(_) => already,
                    other => EngineError::SubscriptionPersist(other.to_string()),
                }
            })?;

        let row = match ctx.response.mandate_ref() {
            Some(mandate) => self.confirm_mandate(row, mandate).await?,
            None => row,
        };

        self.remember(payment_id.to_string(), row.id.clone())?;
        info!(subscription_id = %row.id, total = %row.total_amount, "payment verified");
        Ok(row)
    }

    /// Returns the row a previously verified payment id produced.
    async fn replay(&self, payment_id: &str) -> Result<Option<UserSubscription>> {
        let Some(known) = self.recall(payment_id)? else {
            return Ok(None);
        };
        if let Some(row) = self.ledger.fetch(&known).await? {
            info!(
                subscription_id = %known,
                "payment already verified, replaying original outcome"
            );
            return Ok(Some(row));
        }
        warn!(
            subscription_id = %known,
            "cached verification points at a missing row, re-verifying"
        );
        Ok(None)
    }

    async fn acquire_payment_lock(&self, payment_id: &str) -> PaymentLock {
        let mut flights = self.in_flight.lock().await;
        flights.entry(payment_id.to_string()).or_default().clone()
    }

    async fn release_payment_lock(&self, payment_id: &str, lock: PaymentLock) {
        let mut flights = self.in_flight.lock().await;
        // Two holders left means the map's entry and ours: no waiter is
        // queued behind this payment id, so the slot can go.
        if let Some(current) = flights.get(payment_id)
            && Arc::ptr_eq(current, &lock)
            && Arc::strong_count(&lock) == 2
        {
            flights.remove(payment_id);
        }
    }

    /// Records a confirmed autopay mandate on a freshly written row.
    ///
    /// The write is mandatory; the read-back is best effort. When the
    /// store's reads lag its writes the locally updated row is returned
    /// and the poll outcome is only logged.
    async fn confirm_mandate(
        &self,
        row: UserSubscription,
        mandate: crate::gateway::MandateRef,
    ) -> Result<UserSubscription> {
        let updated = self
            .ledger
            .attach_mandate(&row.id, mandate, MandateStatus::Confirmed, true)
            .await
            .map_err(|source| {
                error!(
                    subscription_id = %row.id,
                    error = %source,
                    "mandate could not be recorded after a successful charge"
                );
                match source {
                    already @ EngineError::SubscriptionPersist(_) => already,
                    other => EngineError::SubscriptionPersist(other.to_string()),
                }
            })?;

        let ledger = &self.ledger;
        let probe_id = updated.id.clone();
        let probe_ref = &probe_id;
        let visible = poll_until_visible(&self.policy, move || async move {
            Ok(match ledger.fetch(probe_ref).await? {
                Some(read) if read.mandate_status == MandateStatus::Confirmed => {
                    Visibility::Visible(read)
                }
                _ => Visibility::NotYetVisible,
            })
        })
        .await;

        match visible {
            Ok(Visibility::Visible(read)) => Ok(read),
            Ok(Visibility::NotYetVisible) => {
                warn!(
                    subscription_id = %updated.id,
                    "confirmed mandate not yet visible to reads, returning local row"
                );
                Ok(updated)
            }
            Err(error) => {
                warn!(
                    subscription_id = %updated.id,
                    error = %error,
                    "mandate read-back failed, returning local row"
                );
                Ok(updated)
            }
        }
    }

    fn recall(&self, payment_id: &str) -> Result<Option<SubscriptionId>> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| EngineError::Backend("verification cache lock poisoned".to_string()))?;
        Ok(seen.get(payment_id).cloned())
    }

    fn remember(&self, payment_id: String, subscription_id: SubscriptionId) -> Result<()> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| EngineError::Backend("verification cache lock poisoned".to_string()))?;
        seen.put(payment_id, subscription_id);
        Ok(())
    }
}
