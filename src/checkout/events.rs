//! Post-payment event fan-out.
//!
//! Successful checkouts publish a [`PaymentSucceeded`] event on a
//! broadcast channel. Side effects that hang off a purchase (receipt
//! mail, entitlement refreshes) subscribe and react out of band; the
//! checkout flow itself never waits on them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::debug;

use crate::catalog::PlanId;
use crate::ledger::SubscriptionId;

/// A payment cleared and the subscription ledger was updated.
///
/// Published exactly once per completed checkout, after verification and
/// the ledger write both succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSucceeded {
    /// The purchasing user.
    pub user_id: String,
    /// The plan that was purchased.
    pub plan_id: PlanId,
    /// The ledger row the purchase activated.
    pub subscription_id: SubscriptionId,
    /// Total amount charged, tax included. Zero for fully discounted
    /// checkouts.
    pub amount: Decimal,
    /// When the checkout completed.
    pub occurred_at: DateTime<Utc>,
}

/// Broadcast hub for checkout events.
///
/// Cloning shares the underlying channel. Events published while no
/// subscriber is listening are dropped silently; a slow subscriber that
/// falls more than the channel capacity behind loses the oldest events,
/// which is the standard broadcast-channel trade-off.
#[derive(Debug, Clone)]
pub struct CheckoutEvents {
    tx: broadcast::Sender<PaymentSucceeded>,
}

impl CheckoutEvents {
    /// Creates a hub whose channel buffers up to `capacity` events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to events published from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PaymentSucceeded> {
        self.tx.subscribe()
    }

    /// Publishes a success event to all current subscribers.
    pub fn publish_success(&self, event: PaymentSucceeded) {
        match self.tx.send(event) {
            Ok(delivered) => debug!(delivered, "payment success event published"),
            Err(_) => debug!("payment success event dropped, no subscribers"),
        }
    }
}
