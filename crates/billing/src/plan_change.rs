//! Plan change orchestration
//!
//! Previews and executes plan transitions against the canonical
//! subscription. Upgrades take effect immediately with proration; downgrades
//! are deferred to the end of the current period by flagging the current
//! subscription for cancellation and creating a replacement whose paid
//! period starts at that boundary. The canonical pointer only moves after
//! the provider confirms a transition.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provider::{
    PaymentProvider, ProviderPrice, ProviderSubscription, SetupIntentHandle,
};
use crate::store::BillingStore;
use crate::subscriptions::SubscriptionService;

/// Direction of a plan change, classified by amount comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanChangeType {
    Upgrade,
    Downgrade,
    Same,
}

/// When a plan change takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTiming {
    Immediate,
    EndOfPeriod,
}

/// Preview of a plan change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanChangePreview {
    pub current_subscription_id: String,
    pub current_price_id: String,
    pub current_amount_cents: i64,
    pub new_price_id: String,
    pub new_amount_cents: i64,
    pub change_type: PlanChangeType,
    pub timing: ChangeTiming,
    /// Prorated charge due now, in minor currency units. Zero unless this
    /// is an upgrade.
    pub immediate_charge_cents: i64,
    pub days_remaining: i64,
    /// Set for downgrades: the current period end the change defers to.
    pub scheduled_date: Option<OffsetDateTime>,
    pub description: String,
}

/// Result of executing a plan change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanChangeOutcome {
    /// Upgrade applied immediately; the subscription now carries the new
    /// price.
    Upgraded { subscription: ProviderSubscription },
    /// Downgrade scheduled: the current subscription runs out its period,
    /// then the deferred subscription takes over.
    Scheduled {
        current_subscription_id: String,
        scheduled_subscription_id: String,
        effective_date: OffsetDateTime,
    },
    /// The customer has no usable payment method; complete setup with the
    /// handle and retry.
    PaymentSetupRequired { setup: SetupIntentHandle },
}

/// A pending deferred plan change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledChange {
    pub subscription_id: String,
    pub price_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub effective_date: OffsetDateTime,
}

/// Classify a plan change by comparing recurring amounts.
pub fn classify_change(current_amount_cents: i64, new_amount_cents: i64) -> PlanChangeType {
    match new_amount_cents.cmp(&current_amount_cents) {
        std::cmp::Ordering::Greater => PlanChangeType::Upgrade,
        std::cmp::Ordering::Less => PlanChangeType::Downgrade,
        std::cmp::Ordering::Equal => PlanChangeType::Same,
    }
}

/// Prorated upgrade charge: the price delta scaled by the fraction of the
/// current period remaining, rounded to the nearest minor unit. Never
/// negative.
pub fn prorated_charge_cents(delta_cents: i64, remaining_days: i64, total_days: i64) -> i64 {
    if delta_cents <= 0 || remaining_days <= 0 || total_days <= 0 {
        return 0;
    }
    let remaining = remaining_days.min(total_days);
    ((delta_cents as f64) * (remaining as f64) / (total_days as f64)).round() as i64
}

fn format_amount(cents: i64, currency: &str) -> String {
    format!("${:.2} {}", cents as f64 / 100.0, currency.to_uppercase())
}

/// Plan change service
#[derive(Clone)]
pub struct PlanChangeService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    prices: Arc<PriceIds>,
    event_logger: BillingEventLogger,
    payment_method_attempts: u32,
    payment_method_base_delay: Duration,
}

impl PlanChangeService {
    /// Default bound on payment-method propagation polling.
    const PAYMENT_METHOD_MAX_ATTEMPTS: u32 = 3;
    const PAYMENT_METHOD_BASE_DELAY: Duration = Duration::from_millis(750);

    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        prices: Arc<PriceIds>,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            provider,
            store,
            prices,
            event_logger,
            payment_method_attempts: Self::PAYMENT_METHOD_MAX_ATTEMPTS,
            payment_method_base_delay: Self::PAYMENT_METHOD_BASE_DELAY,
        }
    }

    /// Override the payment-method polling bounds.
    pub fn with_payment_method_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.payment_method_attempts = attempts.max(1);
        self.payment_method_base_delay = base_delay;
        self
    }

    /// Preview the transition from the canonical subscription to
    /// `new_price_id` without executing anything.
    pub async fn preview(
        &self,
        user_id: Uuid,
        new_price_id: &str,
    ) -> BillingResult<PlanChangePreview> {
        let current = self.current_subscription(user_id).await?;
        let new_price = self.provider.retrieve_price(new_price_id).await?;

        let change_type = classify_change(current.amount_cents, new_price.amount_cents);
        let now = OffsetDateTime::now_utc();
        let total_days = (current.current_period_end - current.current_period_start).whole_days();
        let days_remaining = if now >= current.current_period_end {
            0
        } else {
            ((current.current_period_end - now).whole_seconds() as f64 / 86_400.0).ceil() as i64
        };

        let immediate_charge_cents = match change_type {
            PlanChangeType::Upgrade => prorated_charge_cents(
                new_price.amount_cents - current.amount_cents,
                days_remaining,
                total_days,
            ),
            _ => 0,
        };

        let (timing, scheduled_date) = match change_type {
            PlanChangeType::Downgrade => {
                (ChangeTiming::EndOfPeriod, Some(current.current_period_end))
            }
            _ => (ChangeTiming::Immediate, None),
        };

        let description = match change_type {
            PlanChangeType::Upgrade => format!(
                "Upgrade from {} to {} per {}: {} due now for the remaining {} days of the current period",
                format_amount(current.amount_cents, &current.currency),
                format_amount(new_price.amount_cents, &new_price.currency),
                new_price.interval,
                format_amount(immediate_charge_cents, &new_price.currency),
                days_remaining,
            ),
            PlanChangeType::Downgrade => format!(
                "Downgrade from {} to {} per {}, taking effect at the end of the current period on {}",
                format_amount(current.amount_cents, &current.currency),
                format_amount(new_price.amount_cents, &new_price.currency),
                new_price.interval,
                current.current_period_end,
            ),
            PlanChangeType::Same => "The selected plan has the same price as the current plan"
                .to_string(),
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %current.id,
            new_price_id = %new_price_id,
            change_type = ?change_type,
            immediate_charge_cents = immediate_charge_cents,
            days_remaining = days_remaining,
            "Previewed plan change"
        );

        Ok(PlanChangePreview {
            current_subscription_id: current.id,
            current_price_id: current.price_id,
            current_amount_cents: current.amount_cents,
            new_price_id: new_price.id,
            new_amount_cents: new_price.amount_cents,
            change_type,
            timing,
            immediate_charge_cents,
            days_remaining,
            scheduled_date,
            description,
        })
    }

    /// Execute a plan change previously previewed as `change_type`.
    ///
    /// The type is re-derived from current amounts and must still match;
    /// a mismatch means prices moved between preview and execute.
    pub async fn execute_plan_change(
        &self,
        user_id: Uuid,
        new_price_id: &str,
        change_type: PlanChangeType,
    ) -> BillingResult<PlanChangeOutcome> {
        let current = self.current_subscription(user_id).await?;
        let new_price = self.provider.retrieve_price(new_price_id).await?;

        let actual = classify_change(current.amount_cents, new_price.amount_cents);
        if actual != change_type {
            return Err(BillingError::InvalidPlanChange(format!(
                "Requested a {:?} but the transition from {} to {} is a {:?}",
                change_type, current.price_id, new_price.id, actual
            )));
        }

        match actual {
            PlanChangeType::Upgrade | PlanChangeType::Same => {
                self.execute_immediate(user_id, current, new_price).await
            }
            PlanChangeType::Downgrade => {
                self.execute_deferred(user_id, current, new_price).await
            }
        }
    }

    /// Immediate price swap with proration (upgrade or lateral change).
    async fn execute_immediate(
        &self,
        user_id: Uuid,
        current: ProviderSubscription,
        new_price: ProviderPrice,
    ) -> BillingResult<PlanChangeOutcome> {
        // A free target needs no payment method at all
        if new_price.amount_cents > 0 {
            let has_method = self
                .wait_for_payment_method(&current.customer_id)
                .await?;
            if !has_method {
                let setup = self
                    .provider
                    .create_setup_intent(&current.customer_id)
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    customer_id = %current.customer_id,
                    setup_intent_id = %setup.id,
                    "Plan change needs payment setup, returning setup handle"
                );
                return Ok(PlanChangeOutcome::PaymentSetupRequired { setup });
            }
        }

        let updated = self
            .provider
            .update_subscription_price(&current.id, &new_price.id, true)
            .await?;

        // Provider confirmed; only now move the canonical pointer
        self.store
            .set_canonical_subscription(user_id, Some(&updated.id))
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            price_id = %new_price.id,
            "Executed immediate plan change"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PlanChangeExecuted)
                    .data(serde_json::json!({
                        "subscription_id": updated.id.clone(),
                        "from_price_id": current.price_id,
                        "to_price_id": new_price.id,
                    }))
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log plan change executed event");
        }

        Ok(PlanChangeOutcome::Upgraded {
            subscription: updated,
        })
    }

    /// Deferred downgrade: run out the current period, then start the
    /// replacement subscription at the boundary.
    async fn execute_deferred(
        &self,
        user_id: Uuid,
        current: ProviderSubscription,
        new_price: ProviderPrice,
    ) -> BillingResult<PlanChangeOutcome> {
        let effective_date = current.current_period_end;

        self.provider
            .set_cancel_at_period_end(&current.id, true)
            .await?;

        let scheduled = self
            .provider
            .create_scheduled_subscription(
                &current.customer_id,
                &new_price.id,
                effective_date,
                &current.id,
            )
            .await?;

        // The current subscription stays canonical until the boundary; the
        // next read after the provider swaps them re-resolves the pointer

        tracing::info!(
            user_id = %user_id,
            current_subscription_id = %current.id,
            scheduled_subscription_id = %scheduled.id,
            effective_date = %effective_date,
            "Scheduled downgrade at period end"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PlanChangeScheduled)
                    .data(serde_json::json!({
                        "current_subscription_id": current.id.clone(),
                        "scheduled_subscription_id": scheduled.id.clone(),
                        "to_price_id": new_price.id,
                        "effective_date": effective_date.to_string(),
                    }))
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log plan change scheduled event");
        }

        Ok(PlanChangeOutcome::Scheduled {
            current_subscription_id: current.id,
            scheduled_subscription_id: scheduled.id,
            effective_date,
        })
    }

    /// Pending deferred changes for the user's customer.
    pub async fn list_scheduled_changes(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<ScheduledChange>> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))?;
        let customer_id = user.stripe_customer_id.ok_or_else(|| {
            BillingError::NotFound(format!("User {} has no billing customer", user_id))
        })?;

        let scheduled = self
            .provider
            .list_scheduled_subscriptions(&customer_id)
            .await?;

        Ok(scheduled
            .into_iter()
            .filter_map(|s| {
                s.trial_end.map(|effective_date| ScheduledChange {
                    subscription_id: s.id,
                    price_id: s.price_id,
                    amount_cents: s.amount_cents,
                    currency: s.currency,
                    effective_date,
                })
            })
            .collect())
    }

    /// Cancel a deferred plan change: the deferred subscription is cancelled
    /// outright and the still-active subscription has its
    /// cancel-at-period-end flag cleared, restoring the prior steady state.
    pub async fn cancel_scheduled_change(
        &self,
        user_id: Uuid,
        scheduled_subscription_id: &str,
    ) -> BillingResult<()> {
        let scheduled = self
            .provider
            .retrieve_subscription(scheduled_subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::SubscriptionNotFound(scheduled_subscription_id.to_string())
            })?;

        if !scheduled.is_scheduled_change() {
            return Err(BillingError::InvalidPlanChange(format!(
                "Subscription {} is not a scheduled change",
                scheduled_subscription_id
            )));
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))?;
        if user.stripe_customer_id.as_deref() != Some(scheduled.customer_id.as_str()) {
            return Err(BillingError::InvalidPlanChange(format!(
                "Subscription {} does not belong to user {}",
                scheduled_subscription_id, user_id
            )));
        }

        self.provider
            .cancel_subscription(scheduled_subscription_id)
            .await?;

        // Restore the subscription the change was going to replace
        let restore_id = scheduled
            .metadata
            .get("replaces_subscription")
            .cloned()
            .or(user.stripe_subscription_id);
        if let Some(active_id) = restore_id {
            self.provider
                .set_cancel_at_period_end(&active_id, false)
                .await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %active_id,
                "Cleared cancel_at_period_end after scheduled change cancellation"
            );
        } else {
            tracing::warn!(
                user_id = %user_id,
                scheduled_subscription_id = %scheduled_subscription_id,
                "No active subscription found to restore after cancelling scheduled change"
            );
        }

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::ScheduledChangeCancelled)
                    .data(serde_json::json!({
                        "scheduled_subscription_id": scheduled_subscription_id,
                    }))
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log scheduled change cancelled event");
        }

        Ok(())
    }

    async fn current_subscription(&self, user_id: Uuid) -> BillingResult<ProviderSubscription> {
        let subscriptions = SubscriptionService::new(
            self.provider.clone(),
            self.store.clone(),
            self.prices.clone(),
        );
        subscriptions.get_current_subscription(user_id).await
    }

    /// Poll for a usable payment method with a bounded number of attempts
    /// and a linearly increasing delay. A newly attached method can lag the
    /// provider's read path; this is the only intentional blocking point in
    /// the billing core.
    async fn wait_for_payment_method(&self, customer_id: &str) -> BillingResult<bool> {
        for attempt in 1..=self.payment_method_attempts {
            let methods = self.provider.list_payment_methods(customer_id).await?;
            if !methods.is_empty() {
                return Ok(true);
            }
            if attempt < self.payment_method_attempts {
                let delay = self.payment_method_base_delay * attempt;
                tracing::debug!(
                    customer_id = %customer_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "No payment method yet, waiting for propagation"
                );
                tokio::time::sleep(delay).await;
            }
        }
        Ok(false)
    }
}
