//! Subscription persistence seam.
//!
//! [`SubscriptionStore`] is the only place ledger rows are read or
//! written. The single-active invariant lives in
//! [`activate_exclusive`](SubscriptionStore::activate_exclusive): demote
//! whatever is active, then insert the new row, inside one critical
//! section. If demotion fails nothing may be activated.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use super::records::{
    BillingIdentity, MandateStatus, SubscriptionId, SubscriptionStatus, UserSubscription,
};
use crate::error::{EngineError, Result};
use crate::gateway::MandateRef;

/// Persistence operations the ledger is built on.
#[async_trait]
pub trait SubscriptionStore: Send + Sync + std::fmt::Debug {
    /// All billing identities held by a user.
    async fn identities_for(&self, user_id: &str) -> Result<Vec<BillingIdentity>>;

    /// Fetches a row by id.
    async fn fetch(&self, id: &SubscriptionId) -> Result<Option<UserSubscription>>;

    /// The most recently created row for an identity.
    async fn latest_for(&self, identity_id: &str) -> Result<Option<UserSubscription>>;

    /// The identity's active row, if it has one.
    async fn active_for(&self, identity_id: &str) -> Result<Option<UserSubscription>>;

    /// Every row ever written for an identity, oldest first.
    async fn history_for(&self, identity_id: &str) -> Result<Vec<UserSubscription>>;

    /// Atomically demotes the identity's active rows and inserts `row`
    /// as the only active one.
    ///
    /// Implementations must run demotion and insertion in one critical
    /// section, abort without activating if demotion fails, and preserve
    /// the sticky trial-usage marker: if any existing row has consumed
    /// the trial, the new row is stored with it consumed too.
    async fn activate_exclusive(&self, row: UserSubscription) -> Result<UserSubscription>;

    /// Attaches a mandate to a row after a verified payment.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SubscriptionPersist`] if the row does not
    /// exist; at this point the payment has already settled.
    async fn update_mandate(
        &self,
        id: &SubscriptionId,
        mandate: MandateRef,
        status: MandateStatus,
        autopay: bool,
    ) -> Result<UserSubscription>;

    /// Sets a row's lifecycle status.
    async fn set_status(
        &self,
        id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<UserSubscription>;

    /// Cancels a row: status, autopay and any mandate are all ended
    /// together.
    async fn cancel(&self, id: &SubscriptionId) -> Result<UserSubscription>;
}

#[derive(Debug, Default)]
struct LedgerTables {
    /// Identities keyed by user id.
    identities: HashMap<String, Vec<BillingIdentity>>,
    /// Rows keyed by identity id, in insertion order.
    rows: HashMap<String, Vec<UserSubscription>>,
}

impl LedgerTables {
    fn find_row_mut(&mut self, id: &SubscriptionId) -> Option<&mut UserSubscription> {
        self.rows
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|row| &row.id == id)
    }
}

/// In-memory [`SubscriptionStore`] used in tests and single-process
/// deployments.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    inner: Mutex<LedgerTables>,
}

impl InMemorySubscriptionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a billing identity.
    pub async fn register_identity(&self, identity: BillingIdentity) {
        let mut tables = self.inner.lock().await;
        tables
            .identities
            .entry(identity.user_id.clone())
            .or_default()
            .push(identity);
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn identities_for(&self, user_id: &str) -> Result<Vec<BillingIdentity>> {
        let tables = self.inner.lock().await;
        Ok(tables.identities.get(user_id).cloned().unwrap_or_default())
    }

    async fn fetch(&self, id: &SubscriptionId) -> Result<Option<UserSubscription>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .rows
            .values()
            .flat_map(|rows| rows.iter())
            .find(|row| &row.id == id)
            .cloned())
    }

    async fn latest_for(&self, identity_id: &str) -> Result<Option<UserSubscription>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .rows
            .get(identity_id)
            .and_then(|rows| rows.iter().max_by_key(|row| row.created_at))
            .cloned())
    }

    async fn active_for(&self, identity_id: &str) -> Result<Option<UserSubscription>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .rows
            .get(identity_id)
            .and_then(|rows| rows.iter().find(|row| row.is_active()))
            .cloned())
    }

    async fn history_for(&self, identity_id: &str) -> Result<Vec<UserSubscription>> {
        let tables = self.inner.lock().await;
        Ok(tables.rows.get(identity_id).cloned().unwrap_or_default())
    }

    async fn activate_exclusive(&self, row: UserSubscription) -> Result<UserSubscription> {
        let mut tables = self.inner.lock().await;
        let rows = tables.rows.entry(row.identity_id.clone()).or_default();
        let now = Utc::now();

        // Sticky marker: once any row consumed the trial, every later
        // row is stored with it consumed.
        let mut row = row;
        if rows.iter().any(|existing| existing.has_used_trial) {
            row.has_used_trial = true;
        }

        let mut demoted = 0;
        for existing in rows.iter_mut().filter(|existing| existing.is_active()) {
            existing.deactivate(now);
            demoted += 1;
        }

        row.status = SubscriptionStatus::Active;
        row.updated_at = now;
        rows.push(row.clone());

        debug!(
            identity_id = %row.identity_id,
            subscription_id = %row.id,
            demoted,
            "activated subscription row"
        );
        Ok(row)
    }

    async fn update_mandate(
        &self,
        id: &SubscriptionId,
        mandate: MandateRef,
        status: MandateStatus,
        autopay: bool,
    ) -> Result<UserSubscription> {
        let mut tables = self.inner.lock().await;
        let row = tables.find_row_mut(id).ok_or_else(|| {
            EngineError::SubscriptionPersist(format!(
                "subscription '{id}' not found for mandate update"
            ))
        })?;

        row.attach_mandate(mandate, status, autopay);
        Ok(row.clone())
    }

    async fn set_status(
        &self,
        id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<UserSubscription> {
        let mut tables = self.inner.lock().await;
        let row = tables
            .find_row_mut(id)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown subscription id '{id}'")))?;

        row.status = status;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn cancel(&self, id: &SubscriptionId) -> Result<UserSubscription> {
        let mut tables = self.inner.lock().await;
        let row = tables
            .find_row_mut(id)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown subscription id '{id}'")))?;

        row.status = SubscriptionStatus::Cancelled;
        row.is_in_trial = false;
        row.autopay_enabled = false;
        if row.mandate.is_some() {
            row.mandate_status = MandateStatus::Revoked;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use rust_decimal::Decimal;

    use super::*;
    use crate::catalog::{BillingInterval, PlanId, PlanTier, SubscriptionPlan, UserType};
    use crate::gateway::Gateway;
    use crate::pricing::TaxBreakdown;

    fn identity(id: &str, user_id: &str) -> BillingIdentity {
        BillingIdentity {
            id: id.to_string(),
            user_id: user_id.to_string(),
            role: UserType::Startup,
            created_at: Utc::now(),
        }
    }

    fn plan() -> SubscriptionPlan {
        SubscriptionPlan {
            id: PlanId::new("startup-pro-monthly").unwrap(),
            name: "Startup Pro".to_string(),
            user_type: UserType::Startup,
            tier: PlanTier::Pro,
            base_price: Decimal::from(100),
            currency: None,
            tax_percentage: Decimal::from(18),
            interval: BillingInterval::Monthly,
            country: None,
            active: true,
        }
    }

    fn paid_row(identity: &BillingIdentity) -> UserSubscription {
        let tax = TaxBreakdown::compute(Decimal::from(100), Decimal::from(18)).unwrap();
        let start = Utc::now();
        UserSubscription::new_paid(
            identity,
            &plan(),
            Decimal::from(100),
            &tax,
            "INR".to_string(),
            start,
            start + Duration::days(30),
            None,
            Some(Gateway::Razorpay),
        )
    }

    #[tokio::test]
    async fn test_identities_round_trip() {
        let store = InMemorySubscriptionStore::new();
        store.register_identity(identity("id-1", "user-1")).await;
        store.register_identity(identity("id-2", "user-1")).await;

        let identities = store.identities_for("user-1").await.unwrap();
        assert_eq!(identities.len(), 2);
        assert!(store.identities_for("user-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activation_demotes_previous_active_row() {
        let store = InMemorySubscriptionStore::new();
        let identity = identity("id-1", "user-1");

        let first = store.activate_exclusive(paid_row(&identity)).await.unwrap();
        let second = store.activate_exclusive(paid_row(&identity)).await.unwrap();

        let active = store.active_for("id-1").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);

        let history = store.history_for("id-1").await.unwrap();
        assert_eq!(history.len(), 2);
        let demoted = history.iter().find(|row| row.id == first.id).unwrap();
        assert_eq!(demoted.status, SubscriptionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_trial_usage_marker_is_sticky_across_activations() {
        let store = InMemorySubscriptionStore::new();
        let identity = identity("id-1", "user-1");

        // First activation consumed the trial.
        store.activate_exclusive(paid_row(&identity)).await.unwrap();

        // A row claiming the trial is unused gets corrected on write.
        let mut fresh = paid_row(&identity);
        fresh.has_used_trial = false;
        let stored = store.activate_exclusive(fresh).await.unwrap();
        assert!(stored.has_used_trial);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_activations_leave_exactly_one_active() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let identity = identity("id-1", "user-1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let row = paid_row(&identity);
            handles.push(tokio::spawn(
                async move { store.activate_exclusive(row).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = store.history_for("id-1").await.unwrap();
        assert_eq!(history.len(), 8);
        assert_eq!(history.iter().filter(|row| row.is_active()).count(), 1);
    }

    #[tokio::test]
    async fn test_update_mandate_attaches_to_existing_row() {
        let store = InMemorySubscriptionStore::new();
        let identity = identity("id-1", "user-1");
        let row = store.activate_exclusive(paid_row(&identity)).await.unwrap();

        let updated = store
            .update_mandate(
                &row.id,
                MandateRef::new(Gateway::Razorpay, "sub_provider_1"),
                MandateStatus::Confirmed,
                true,
            )
            .await
            .unwrap();

        assert_eq!(updated.mandate_status, MandateStatus::Confirmed);
        assert!(updated.autopay_enabled);
    }

    #[tokio::test]
    async fn test_update_mandate_on_missing_row_is_a_persist_error() {
        let store = InMemorySubscriptionStore::new();
        let error = store
            .update_mandate(
                &SubscriptionId::generate(),
                MandateRef::new(Gateway::Razorpay, "sub_x"),
                MandateStatus::Confirmed,
                true,
            )
            .await
            .unwrap_err();

        assert!(matches!(error, EngineError::SubscriptionPersist(_)));
    }

    #[tokio::test]
    async fn test_cancel_revokes_mandate_and_autopay() {
        let store = InMemorySubscriptionStore::new();
        let identity = identity("id-1", "user-1");
        let row = store.activate_exclusive(paid_row(&identity)).await.unwrap();
        store
            .update_mandate(
                &row.id,
                MandateRef::new(Gateway::Razorpay, "sub_provider_1"),
                MandateStatus::Confirmed,
                true,
            )
            .await
            .unwrap();

        let cancelled = store.cancel(&row.id).await.unwrap();

        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.mandate_status, MandateStatus::Revoked);
        assert!(!cancelled.autopay_enabled);
    }

    #[tokio::test]
    async fn test_latest_for_returns_newest_row() {
        let store = InMemorySubscriptionStore::new();
        let identity = identity("id-1", "user-1");

        store.activate_exclusive(paid_row(&identity)).await.unwrap();
        let newest = store.activate_exclusive(paid_row(&identity)).await.unwrap();

        let latest = store.latest_for("id-1").await.unwrap().unwrap();
        assert_eq!(latest.id, newest.id);
    }
}
