//! Stripe implementation of the payment provider trait
//!
//! All raw Stripe payloads are converted into the typed structures in
//! [`crate::provider`] here, at the boundary. Nothing outside this module
//! touches `stripe::*` object shapes.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, CreateCustomer, CreateSetupIntent, CreateSubscription,
    CreateSubscriptionItems, Customer, CustomerId, ListCustomers, ListSubscriptions, Object,
    Price, PriceId, Product, ProductId, SetupIntent, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription, UpdateSubscriptionItems,
};
// Import the proration behavior enum from the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingInterval, PaymentProvider, ProviderCustomer, ProviderPaymentMethod, ProviderPrice,
    ProviderProduct, ProviderSubscription, SetupIntentHandle, SubscriptionState,
    SCHEDULED_CHANGE_METADATA_KEY,
};

/// Stripe-backed payment provider
#[derive(Clone)]
pub struct StripeProvider {
    client: StripeClient,
}

impl StripeProvider {
    pub fn new(client: StripeClient) -> Self {
        Self { client }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeClient::from_env()?))
    }

    fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
        customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::ProviderApi(format!("Invalid customer ID: {}", e)))
    }

    fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::ProviderApi(format!("Invalid subscription ID: {}", e)))
    }

    fn timestamp(ts: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(ts).unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    fn map_customer(customer: Customer) -> ProviderCustomer {
        ProviderCustomer {
            id: customer.id.to_string(),
            email: customer.email.clone(),
            created: customer.created.map(Self::timestamp).unwrap_or_else(OffsetDateTime::now_utc),
            deleted: customer.deleted,
        }
    }

    fn map_subscription(subscription: &Subscription) -> BillingResult<ProviderSubscription> {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        let item_price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .ok_or_else(|| {
                BillingError::ProviderInconsistency(format!(
                    "Subscription {} has no priced items",
                    subscription.id
                ))
            })?;

        let product_id = item_price.product.as_ref().map(|p| match p {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(product) => product.id.to_string(),
        });

        let interval = item_price
            .recurring
            .as_ref()
            .map(|recurring| match recurring.interval {
                stripe::RecurringInterval::Year => BillingInterval::Year,
                _ => BillingInterval::Month,
            })
            .unwrap_or(BillingInterval::Month);

        let state = match subscription.status {
            StripeSubStatus::Active => SubscriptionState::Active,
            StripeSubStatus::Trialing => SubscriptionState::Trialing,
            StripeSubStatus::PastDue => SubscriptionState::PastDue,
            StripeSubStatus::Canceled => SubscriptionState::Canceled,
            StripeSubStatus::Incomplete => SubscriptionState::Incomplete,
            StripeSubStatus::IncompleteExpired => SubscriptionState::IncompleteExpired,
            StripeSubStatus::Unpaid => SubscriptionState::Unpaid,
            // The only remaining status is paused
            _ => SubscriptionState::Paused,
        };

        Ok(ProviderSubscription {
            id: subscription.id.to_string(),
            customer_id,
            state,
            price_id: item_price.id.to_string(),
            product_id,
            amount_cents: item_price.unit_amount.unwrap_or(0),
            currency: item_price
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "usd".to_string()),
            interval,
            current_period_start: Self::timestamp(subscription.current_period_start),
            current_period_end: Self::timestamp(subscription.current_period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
            trial_end: subscription.trial_end.map(Self::timestamp),
            created: Self::timestamp(subscription.created),
            metadata: subscription.metadata.clone().into_iter().collect(),
        })
    }

    async fn list_subscriptions_for(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let customer_id = Self::parse_customer_id(customer_id)?;

        let mut params = ListSubscriptions::new();
        params.customer = Some(customer_id);
        params.limit = Some(100);

        let subscriptions = Subscription::list(self.client.inner(), &params).await?;

        subscriptions
            .data
            .iter()
            .map(Self::map_subscription)
            .collect()
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_customer(
        &self,
        email: &str,
        user_id: Uuid,
    ) -> BillingResult<ProviderCustomer> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "oratio".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.client.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(Self::map_customer(customer))
    }

    async fn retrieve_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderCustomer>> {
        let customer_id = Self::parse_customer_id(customer_id)?;

        match Customer::retrieve(self.client.inner(), &customer_id, &[]).await {
            Ok(customer) => Ok(Some(Self::map_customer(customer))),
            Err(e) => match BillingError::from(e) {
                BillingError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> BillingResult<Option<ProviderCustomer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(10);

        let customers = Customer::list(self.client.inner(), &params).await?;

        Ok(customers
            .data
            .into_iter()
            .map(Self::map_customer)
            .find(|c| !c.deleted))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id = Self::parse_customer_id(customer_id)?;

        let mut metadata = HashMap::new();
        metadata.insert("platform".to_string(), "oratio".to_string());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        let subscription = Subscription::create(self.client.inner(), params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            price_id = %price_id,
            "Created subscription"
        );

        Self::map_subscription(&subscription)
    }

    async fn create_scheduled_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        start: OffsetDateTime,
        replaces_subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id = Self::parse_customer_id(customer_id)?;

        let mut metadata = HashMap::new();
        metadata.insert(SCHEDULED_CHANGE_METADATA_KEY.to_string(), "true".to_string());
        metadata.insert(
            "replaces_subscription".to_string(),
            replaces_subscription_id.to_string(),
        );

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        // The paid period starts when the trial boundary elapses
        params.trial_end = Some(stripe::Scheduled::Timestamp(start.unix_timestamp()));

        let subscription = Subscription::create(self.client.inner(), params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            price_id = %price_id,
            start = %start,
            replaces = %replaces_subscription_id,
            "Created scheduled subscription"
        );

        Self::map_subscription(&subscription)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let subscription_id = Self::parse_subscription_id(subscription_id)?;

        match Subscription::retrieve(self.client.inner(), &subscription_id, &[]).await {
            Ok(subscription) => Ok(Some(Self::map_subscription(&subscription)?)),
            Err(e) => match BillingError::from(e) {
                BillingError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let subscriptions = self.list_subscriptions_for(customer_id).await?;
        Ok(subscriptions
            .into_iter()
            .filter(|s| s.state.is_usable() && !s.is_scheduled_change())
            .collect())
    }

    async fn list_scheduled_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let now = OffsetDateTime::now_utc();
        let subscriptions = self.list_subscriptions_for(customer_id).await?;
        Ok(subscriptions
            .into_iter()
            .filter(|s| {
                s.is_scheduled_change()
                    && s.state == SubscriptionState::Trialing
                    && s.trial_end.map(|t| t > now).unwrap_or(false)
            })
            .collect())
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        prorate: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        // Need the existing item id to swap the price in place
        let current = Subscription::retrieve(self.client.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(if prorate {
                SubscriptionProrationBehavior::CreateProrations
            } else {
                SubscriptionProrationBehavior::None
            }),
            ..Default::default()
        };

        let subscription = Subscription::update(self.client.inner(), &sub_id, params)
            .await
            .map_err(|e| {
                // Stripe rejects the in-place swap when the customer cannot be charged
                let err_str = e.to_string();
                if err_str.contains("no attached payment source")
                    || err_str.contains("no default payment method")
                {
                    tracing::warn!(
                        subscription_id = %sub_id,
                        error = %err_str,
                        "Subscription update failed: customer has no payment method"
                    );
                    return BillingError::PaymentMethodRequired;
                }
                BillingError::from(e)
            })?;

        tracing::info!(
            subscription_id = %subscription.id,
            price_id = %price_id,
            prorate = prorate,
            "Updated subscription price"
        );

        Self::map_subscription(&subscription)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };

        let subscription = Subscription::update(self.client.inner(), &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            cancel_at_period_end = cancel,
            "Updated cancel_at_period_end"
        );

        Self::map_subscription(&subscription)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = Subscription::cancel(self.client.inner(), &sub_id, params).await?;

        tracing::info!(subscription_id = %subscription.id, "Cancelled subscription");

        Self::map_subscription(&subscription)
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<ProviderPrice> {
        let parsed = price_id
            .parse::<PriceId>()
            .map_err(|e| BillingError::ProviderApi(format!("Invalid price ID: {}", e)))?;

        let price = Price::retrieve(self.client.inner(), &parsed, &[]).await?;

        let product_id = price.product.as_ref().map(|p| match p {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(product) => product.id.to_string(),
        });

        let interval = price
            .recurring
            .as_ref()
            .map(|recurring| match recurring.interval {
                stripe::RecurringInterval::Year => BillingInterval::Year,
                _ => BillingInterval::Month,
            })
            .unwrap_or(BillingInterval::Month);

        Ok(ProviderPrice {
            id: price.id.to_string(),
            product_id,
            amount_cents: price.unit_amount.unwrap_or(0),
            currency: price
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "usd".to_string()),
            interval,
            active: price.active.unwrap_or(false),
        })
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        let parsed = product_id
            .parse::<ProductId>()
            .map_err(|e| BillingError::ProviderApi(format!("Invalid product ID: {}", e)))?;

        let product = Product::retrieve(self.client.inner(), &parsed, &[]).await?;

        Ok(ProviderProduct {
            id: product.id.to_string(),
            name: product.name.clone().unwrap_or_default(),
            metadata: product
                .metadata
                .clone()
                .map(|m| m.into_iter().collect())
                .unwrap_or_default(),
        })
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderPaymentMethod>> {
        let parsed = Self::parse_customer_id(customer_id)?;

        let customer = Customer::retrieve(self.client.inner(), &parsed, &[]).await?;

        let mut methods = Vec::new();

        if let Some(source) = customer.default_source.as_ref() {
            let id = match source {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(obj) => obj.id().to_string(),
            };
            methods.push(ProviderPaymentMethod {
                id,
                kind: "default_source".to_string(),
            });
        }

        if let Some(payment_method) = customer
            .invoice_settings
            .as_ref()
            .and_then(|settings| settings.default_payment_method.as_ref())
        {
            let id = match payment_method {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(obj) => obj.id.to_string(),
            };
            methods.push(ProviderPaymentMethod {
                id,
                kind: "default_payment_method".to_string(),
            });
        }

        Ok(methods)
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentHandle> {
        let parsed = Self::parse_customer_id(customer_id)?;

        let mut params = CreateSetupIntent::new();
        params.customer = Some(parsed);

        let setup_intent = SetupIntent::create(self.client.inner(), params).await?;

        tracing::info!(
            customer_id = %customer_id,
            setup_intent_id = %setup_intent.id,
            "Created setup intent for payment method collection"
        );

        Ok(SetupIntentHandle {
            id: setup_intent.id.to_string(),
            client_secret: setup_intent.client_secret.clone(),
        })
    }
}
