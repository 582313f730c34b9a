//! Subscription management
//!
//! Resolves the single canonical subscription for a user against the
//! provider, which is the source of truth and can drift: customers get
//! deleted, plan-change races leave duplicate active subscriptions behind,
//! and the stored pointer can go stale. Where a deterministic recovery
//! exists it is applied and logged; duplicates are never auto-cancelled
//! here (cleanup is an explicit operator action, see
//! [`crate::invariants::InvariantChecker::cleanup_duplicate_subscriptions`]).

use std::sync::Arc;

use oratio_shared::PlanTier;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provider::{PaymentProvider, ProviderSubscription};
use crate::store::BillingStore;

/// Subscription service owning canonical-subscription resolution
#[derive(Clone)]
pub struct SubscriptionService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    prices: Arc<PriceIds>,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
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
        }
    }

    /// The read-path entry point: resolve the user's customer, then the
    /// canonical subscription, creating a default free-tier subscription if
    /// the user has none.
    pub async fn get_current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<ProviderSubscription> {
        let customer_service = CustomerService::new(self.provider.clone(), self.store.clone());
        let customer_id = customer_service.ensure_customer(user_id).await?;
        self.resolve_canonical_subscription(user_id, &customer_id)
            .await
    }

    /// Determine the canonical active subscription for a customer and
    /// persist its id on the user record.
    ///
    /// Zero active subscriptions create the default free-tier subscription.
    /// Duplicates resolve to the newest by creation time, with a structured
    /// audit event listing every duplicate for operator visibility.
    pub async fn resolve_canonical_subscription(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let (customer_id, subscriptions) =
            match self.provider.list_active_subscriptions(customer_id).await {
                Ok(subscriptions) => (customer_id.to_string(), subscriptions),
                Err(BillingError::NotFound(_)) => {
                    // The stored customer id itself is invalid; run the
                    // customer recovery path and retry once
                    tracing::warn!(
                        user_id = %user_id,
                        customer_id = %customer_id,
                        "Customer id rejected by provider, re-resolving customer"
                    );
                    let customer_service =
                        CustomerService::new(self.provider.clone(), self.store.clone());
                    let recovered = customer_service.ensure_customer(user_id).await?;
                    let subscriptions =
                        self.provider.list_active_subscriptions(&recovered).await?;
                    (recovered, subscriptions)
                }
                Err(e) => return Err(e),
            };

        match subscriptions.len() {
            0 => self.create_default_subscription(user_id, &customer_id).await,
            1 => {
                let subscription = subscriptions
                    .into_iter()
                    .next()
                    .ok_or_else(|| BillingError::Internal("empty subscription list".to_string()))?;
                self.persist_canonical(user_id, &subscription).await?;
                Ok(subscription)
            }
            count => {
                // Provider-side anomaly, e.g. a race during plan change.
                // Newest-by-creation wins; the rest are reported, not touched.
                let duplicates: Vec<serde_json::Value> = subscriptions
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "subscription_id": s.id,
                            "state": s.state.as_str(),
                            "price_id": s.price_id,
                            "amount_cents": s.amount_cents,
                            "created": s.created.to_string(),
                        })
                    })
                    .collect();

                let canonical = subscriptions
                    .into_iter()
                    .max_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)))
                    .ok_or_else(|| BillingError::Internal("empty subscription list".to_string()))?;

                tracing::warn!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    duplicate_count = count,
                    canonical_subscription_id = %canonical.id,
                    "Multiple active subscriptions found, selected newest as canonical"
                );

                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(
                            user_id,
                            BillingEventType::DuplicateSubscriptionsDetected,
                        )
                        .data(serde_json::json!({
                            "customer_id": customer_id,
                            "canonical_subscription_id": canonical.id.clone(),
                            "duplicates": duplicates,
                        })),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log duplicate subscriptions event");
                }

                self.persist_canonical(user_id, &canonical).await?;
                Ok(canonical)
            }
        }
    }

    /// The word limit for a subscription, sourced from its product's
    /// metadata. Falls back to the tier default when the metadata is absent,
    /// never to a per-call-site constant.
    pub async fn word_limit_for(&self, subscription: &ProviderSubscription) -> BillingResult<i64> {
        if let Some(product_id) = subscription.product_id.as_deref() {
            match self.provider.retrieve_product(product_id).await {
                Ok(product) => {
                    if let Some(limit) = product.word_limit() {
                        return Ok(limit);
                    }
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        product_id = %product_id,
                        "Product metadata has no word limit, using tier default"
                    );
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        product_id = %product_id,
                        error = %e,
                        "Could not retrieve product, using tier default word limit"
                    );
                }
            }
        }

        let tier = self
            .prices
            .plan_for_price_id(&subscription.price_id)
            .map(|(tier, _)| tier)
            .unwrap_or(PlanTier::Free);
        Ok(tier.default_word_limit())
    }

    async fn create_default_subscription(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let subscription = self
            .provider
            .create_subscription(customer_id, &self.prices.free)
            .await?;

        self.persist_canonical(user_id, &subscription).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            "Created default free-tier subscription"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCreated).data(
                    serde_json::json!({
                        "subscription_id": subscription.id.clone(),
                        "price_id": subscription.price_id.clone(),
                        "default_tier": true,
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription created event");
        }

        Ok(subscription)
    }

    /// Persist the canonical pointer if it differs from what is stored.
    async fn persist_canonical(
        &self,
        user_id: Uuid,
        subscription: &ProviderSubscription,
    ) -> BillingResult<()> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))?;

        if user.stripe_subscription_id.as_deref() != Some(subscription.id.as_str()) {
            self.store
                .set_canonical_subscription(user_id, Some(&subscription.id))
                .await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                previous = ?user.stripe_subscription_id,
                "Updated canonical subscription pointer"
            );
        }

        Ok(())
    }
}
