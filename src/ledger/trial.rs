//! Free-trial eligibility and activation.
//!
//! A billing identity gets exactly one trial, ever. Both trial rows and
//! paid rows mark the identity as having used it, so converting a trial
//! to a paid plan (or buying outright) permanently closes the door.

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, instrument, warn};

use crate::backend::{CreateTrialRequest, PaymentBackend};
use crate::catalog::SubscriptionPlan;
use crate::error::{EngineError, Result};
use crate::gateway::{Gateway, MandateRef, select_gateway};
use crate::ledger::records::{BillingIdentity, UserSubscription};
use crate::ledger::SubscriptionLedger;
use crate::pricing::TaxBreakdown;

/// Starts free trials, with or without an autopay mandate.
#[derive(Debug, Clone)]
pub struct TrialManager {
    ledger: SubscriptionLedger,
    backend: Arc<dyn PaymentBackend>,
    trial_days: u32,
    default_gateway: Gateway,
}

impl TrialManager {
    /// Creates a trial manager.
    #[must_use]
    pub fn new(
        ledger: SubscriptionLedger,
        backend: Arc<dyn PaymentBackend>,
        trial_days: u32,
        default_gateway: Gateway,
    ) -> Self {
        Self {
            ledger,
            backend,
            trial_days,
            default_gateway,
        }
    }

    /// Checks that the user may start a trial for this plan's role.
    ///
    /// The active-trial check runs before the used-trial check so a user
    /// re-tapping the trial button sees "already active" rather than the
    /// terminal "already used".
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TrialAlreadyActive`] when a trial is
    /// currently running, [`EngineError::TrialAlreadyUsed`] when any past
    /// row consumed the trial, and [`EngineError::IdentityNotFound`] when
    /// the user has no billing identity.
    pub async fn ensure_eligible(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
    ) -> Result<BillingIdentity> {
        let identity = self.ledger.resolve_identity(user_id, plan.user_type).await?;

        if let Some(active) = self.ledger.active(&identity.id).await?
            && active.in_active_trial()
        {
            warn!(
                user_id,
                subscription_id = %active.id,
                "trial refused, one is already running"
            );
            return Err(EngineError::TrialAlreadyActive);
        }

        let history = self.ledger.history(&identity.id).await?;
        if let Some(used) = history.iter().find(|row| row.has_used_trial) {
            warn!(
                user_id,
                subscription_id = %used.id,
                "trial refused, a past subscription already consumed it"
            );
            return Err(EngineError::TrialAlreadyUsed);
        }

        Ok(identity)
    }

    /// Starts a plain free trial with no payment method on file.
    ///
    /// The trial runs for the configured number of days and ends without
    /// charging; converting to a paid plan is a separate checkout.
    #[instrument(skip(self, plan), fields(user_id, plan_id = %plan.id))]
    pub async fn create_trial(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
    ) -> Result<UserSubscription> {
        self.ensure_eligible(user_id, plan).await?;

        let trial_start = chrono::Utc::now();
        let trial_end = trial_start + Duration::days(i64::from(self.trial_days));

        let row = self
            .ledger
            .activate_trial(plan, user_id, trial_start, trial_end, None)
            .await?;
        info!(
            subscription_id = %row.id,
            trial_end = %trial_end,
            "free trial started"
        );
        Ok(row)
    }

    /// Starts a trial backed by a gateway autopay mandate.
    ///
    /// Registers a trial-phase subscription with the payment backend so
    /// the gateway charges the full recurring amount automatically when
    /// the trial lapses, then records the pending mandate on the row.
    ///
    /// # Errors
    ///
    /// Eligibility errors as in [`TrialManager::ensure_eligible`], plus
    /// any backend rejection. A backend failure writes nothing.
    #[instrument(skip(self, plan), fields(user_id, plan_id = %plan.id))]
    pub async fn start_trial(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
    ) -> Result<UserSubscription> {
        self.ensure_eligible(user_id, plan).await?;

        let gateway = select_gateway(plan.country.as_deref(), self.default_gateway);
        let recurring = TaxBreakdown::compute(plan.base_price, plan.tax_percentage)?;

        let request = CreateTrialRequest {
            user_id: user_id.to_string(),
            plan_name: plan.name.clone(),
            interval: plan.interval,
            trial_days: self.trial_days,
            recurring_amount: recurring.total,
        };
        let response = self.backend.create_trial_subscription(request).await?;

        let trial_start = response.trial_start;
        let trial_end = trial_start + Duration::days(i64::from(self.trial_days));
        let mandate = MandateRef::new(gateway, response.subscription_id);

        let row = self
            .ledger
            .activate_trial(plan, user_id, trial_start, trial_end, Some(mandate))
            .await?;
        info!(
            subscription_id = %row.id,
            gateway = %gateway,
            trial_end = %trial_end,
            "autopay trial started"
        );
        Ok(row)
    }
}
