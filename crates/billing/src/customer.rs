//! Customer resolution
//!
//! Maps a local user to their billing customer identity and heals broken
//! mappings: a deleted or unknown customer id is recovered by email lookup,
//! falling back to creating a fresh customer. The resolved id is persisted
//! on the user record before returning, which makes repeat and concurrent
//! calls idempotent.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provider::PaymentProvider;
use crate::store::BillingStore;

/// Customer service for resolving billing customer identities
#[derive(Clone)]
pub struct CustomerService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    event_logger: BillingEventLogger,
}

impl CustomerService {
    pub fn new(provider: Arc<dyn PaymentProvider>, store: Arc<dyn BillingStore>) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            provider,
            store,
            event_logger,
        }
    }

    /// Resolve (creating or healing as needed) the billing customer id for
    /// a user.
    ///
    /// Transient provider failures surface to the caller without internal
    /// retries; retrying is the caller's decision.
    pub async fn ensure_customer(&self, user_id: Uuid) -> BillingResult<String> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))?;

        if let Some(customer_id) = user.stripe_customer_id.as_deref() {
            match self.provider.retrieve_customer(customer_id).await? {
                Some(customer) if !customer.deleted => {
                    // Email drift between the provider record and the local
                    // user is a non-fatal consistency warning
                    if customer.email.as_deref() != Some(user.email.as_str()) {
                        tracing::warn!(
                            user_id = %user_id,
                            customer_id = %customer_id,
                            provider_email = ?customer.email,
                            local_email = %user.email,
                            "Billing customer email does not match user email"
                        );
                    }
                    return Ok(customer.id);
                }
                Some(_) => {
                    tracing::warn!(
                        user_id = %user_id,
                        customer_id = %customer_id,
                        "Stored billing customer was deleted on the provider, recovering"
                    );
                }
                None => {
                    tracing::warn!(
                        user_id = %user_id,
                        customer_id = %customer_id,
                        "Stored billing customer id is unknown to the provider, recovering"
                    );
                }
            }

            return self.recover_customer(user_id, &user.email, customer_id).await;
        }

        // No customer yet; create one and persist the id before returning
        let customer = self.provider.create_customer(&user.email, user_id).await?;
        self.store.set_customer_id(user_id, &customer.id).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created billing customer"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::CustomerCreated)
                    .data(serde_json::json!({ "customer_id": customer.id.clone() })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log customer created event");
        }

        Ok(customer.id)
    }

    /// Recovery path for a deleted or unknown customer id: adopt an existing
    /// customer with the user's email if one exists, otherwise create a new
    /// one. Either way the new id is persisted before returning.
    async fn recover_customer(
        &self,
        user_id: Uuid,
        email: &str,
        stale_customer_id: &str,
    ) -> BillingResult<String> {
        let (customer, adopted) = match self.provider.find_customer_by_email(email).await? {
            Some(existing) => (existing, true),
            None => (self.provider.create_customer(email, user_id).await?, false),
        };

        self.store.set_customer_id(user_id, &customer.id).await?;

        tracing::info!(
            user_id = %user_id,
            stale_customer_id = %stale_customer_id,
            customer_id = %customer.id,
            adopted = adopted,
            "Recovered billing customer mapping"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::CustomerRecovered).data(
                    serde_json::json!({
                        "stale_customer_id": stale_customer_id,
                        "customer_id": customer.id.clone(),
                        "adopted_by_email": adopted,
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log customer recovered event");
        }

        Ok(customer.id)
    }
}
