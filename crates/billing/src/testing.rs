//! Test support: an in-process fake payment provider
//!
//! Implements [`PaymentProvider`] over plain hash maps with deterministic,
//! counter-based ids so service tests can run the full resolver/auditor/
//! orchestrator flows without the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingInterval, PaymentProvider, ProviderCustomer, ProviderPaymentMethod, ProviderPrice,
    ProviderProduct, ProviderSubscription, SetupIntentHandle, SubscriptionState,
    SCHEDULED_CHANGE_METADATA_KEY, WORD_LIMIT_METADATA_KEY,
};

/// Initialize test logging. Safe to call from any number of tests; only
/// the first call installs the subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct FakeState {
    customers: HashMap<String, ProviderCustomer>,
    subscriptions: HashMap<String, ProviderSubscription>,
    prices: HashMap<String, ProviderPrice>,
    products: HashMap<String, ProviderProduct>,
    payment_methods: HashMap<String, Vec<ProviderPaymentMethod>>,
}

/// Fake payment provider for tests
pub struct FakeProvider {
    state: Mutex<FakeState>,
    counter: AtomicU64,
    base_time: OffsetDateTime,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            counter: AtomicU64::new(0),
            base_time: OffsetDateTime::now_utc(),
        }
    }

    fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_{}", prefix, n)
    }

    /// Monotonically increasing "creation" timestamps so newest-by-creation
    /// selection is deterministic.
    fn next_created(&self) -> OffsetDateTime {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.base_time + Duration::seconds(n as i64)
    }

    pub fn add_price(
        &self,
        id: &str,
        product_id: &str,
        amount_cents: i64,
        interval: BillingInterval,
    ) {
        let mut state = self.state.lock().unwrap();
        state.prices.insert(
            id.to_string(),
            ProviderPrice {
                id: id.to_string(),
                product_id: Some(product_id.to_string()),
                amount_cents,
                currency: "usd".to_string(),
                interval,
                active: true,
            },
        );
    }

    pub fn add_product(&self, id: &str, name: &str, word_limit: Option<i64>) {
        let mut metadata = HashMap::new();
        if let Some(limit) = word_limit {
            metadata.insert(WORD_LIMIT_METADATA_KEY.to_string(), limit.to_string());
        }
        let mut state = self.state.lock().unwrap();
        state.products.insert(
            id.to_string(),
            ProviderProduct {
                id: id.to_string(),
                name: name.to_string(),
                metadata,
            },
        );
    }

    pub fn add_payment_method(&self, customer_id: &str) {
        let mut state = self.state.lock().unwrap();
        let methods = state
            .payment_methods
            .entry(customer_id.to_string())
            .or_default();
        let id = format!("pm_{}", methods.len() + 1);
        methods.push(ProviderPaymentMethod {
            id,
            kind: "default_payment_method".to_string(),
        });
    }

    pub fn insert_customer(&self, id: &str, email: &str, deleted: bool) {
        let mut state = self.state.lock().unwrap();
        state.customers.insert(
            id.to_string(),
            ProviderCustomer {
                id: id.to_string(),
                email: Some(email.to_string()),
                created: self.base_time,
                deleted,
            },
        );
    }

    pub fn mark_customer_deleted(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(customer) = state.customers.get_mut(id) {
            customer.deleted = true;
        }
    }

    /// Insert a fully specified subscription (explicit state and created
    /// timestamp), for duplicate/drift scenarios.
    pub fn insert_subscription(&self, subscription: ProviderSubscription) {
        let mut state = self.state.lock().unwrap();
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
        self.state.lock().unwrap().subscriptions.get(id).cloned()
    }

    pub fn customer_count(&self) -> usize {
        self.state.lock().unwrap().customers.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    /// Build a subscription on a registered price, active now.
    pub fn build_subscription(
        &self,
        id: &str,
        customer_id: &str,
        price_id: &str,
        created: OffsetDateTime,
    ) -> ProviderSubscription {
        let state = self.state.lock().unwrap();
        let price = state
            .prices
            .get(price_id)
            .cloned()
            .unwrap_or_else(|| panic!("price {} not registered", price_id));
        let now = OffsetDateTime::now_utc();
        let period = match price.interval {
            BillingInterval::Month => Duration::days(30),
            BillingInterval::Year => Duration::days(365),
        };
        ProviderSubscription {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            state: SubscriptionState::Active,
            price_id: price.id.clone(),
            product_id: price.product_id.clone(),
            amount_cents: price.amount_cents,
            currency: price.currency.clone(),
            interval: price.interval,
            current_period_start: now,
            current_period_end: now + period,
            cancel_at_period_end: false,
            trial_end: None,
            created,
            metadata: HashMap::new(),
        }
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_customer(
        &self,
        email: &str,
        _user_id: Uuid,
    ) -> BillingResult<ProviderCustomer> {
        let customer = ProviderCustomer {
            id: self.next("cus"),
            email: Some(email.to_string()),
            created: self.next_created(),
            deleted: false,
        };
        let mut state = self.state.lock().unwrap();
        state
            .customers
            .insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn retrieve_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderCustomer>> {
        Ok(self.state.lock().unwrap().customers.get(customer_id).cloned())
    }

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> BillingResult<Option<ProviderCustomer>> {
        let state = self.state.lock().unwrap();
        let mut matches: Vec<&ProviderCustomer> = state
            .customers
            .values()
            .filter(|c| !c.deleted && c.email.as_deref() == Some(email))
            .collect();
        matches.sort_by_key(|c| c.created);
        Ok(matches.first().map(|c| (*c).clone()))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let id = self.next("sub");
        let created = self.next_created();
        let mut state = self.state.lock().unwrap();
        if !state.customers.contains_key(customer_id) {
            return Err(BillingError::NotFound(format!(
                "No such customer: {}",
                customer_id
            )));
        }
        let price = state
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("No such price: {}", price_id)))?;

        let now = OffsetDateTime::now_utc();
        let period = match price.interval {
            BillingInterval::Month => Duration::days(30),
            BillingInterval::Year => Duration::days(365),
        };
        let subscription = ProviderSubscription {
            id: id.clone(),
            customer_id: customer_id.to_string(),
            state: SubscriptionState::Active,
            price_id: price.id.clone(),
            product_id: price.product_id.clone(),
            amount_cents: price.amount_cents,
            currency: price.currency.clone(),
            interval: price.interval,
            current_period_start: now,
            current_period_end: now + period,
            cancel_at_period_end: false,
            trial_end: None,
            created,
            metadata: HashMap::new(),
        };
        state.subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }

    async fn create_scheduled_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        start: OffsetDateTime,
        replaces_subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let id = self.next("sub");
        let created = self.next_created();
        let mut state = self.state.lock().unwrap();
        if !state.customers.contains_key(customer_id) {
            return Err(BillingError::NotFound(format!(
                "No such customer: {}",
                customer_id
            )));
        }
        let price = state
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("No such price: {}", price_id)))?;

        let mut metadata = HashMap::new();
        metadata.insert(SCHEDULED_CHANGE_METADATA_KEY.to_string(), "true".to_string());
        metadata.insert(
            "replaces_subscription".to_string(),
            replaces_subscription_id.to_string(),
        );

        let subscription = ProviderSubscription {
            id: id.clone(),
            customer_id: customer_id.to_string(),
            state: SubscriptionState::Trialing,
            price_id: price.id.clone(),
            product_id: price.product_id.clone(),
            amount_cents: price.amount_cents,
            currency: price.currency.clone(),
            interval: price.interval,
            current_period_start: OffsetDateTime::now_utc(),
            current_period_end: start,
            cancel_at_period_end: false,
            trial_end: Some(start),
            created,
            metadata,
        };
        state.subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .get(subscription_id)
            .cloned())
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let state = self.state.lock().unwrap();
        if !state.customers.contains_key(customer_id) {
            return Err(BillingError::NotFound(format!(
                "No such customer: {}",
                customer_id
            )));
        }
        let mut subscriptions: Vec<ProviderSubscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.customer_id == customer_id && s.state.is_usable() && !s.is_scheduled_change()
            })
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created);
        Ok(subscriptions)
    }

    async fn list_scheduled_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let now = OffsetDateTime::now_utc();
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .values()
            .filter(|s| {
                s.customer_id == customer_id
                    && s.is_scheduled_change()
                    && s.state == SubscriptionState::Trialing
                    && s.trial_end.map(|t| t > now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        _prorate: bool,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.state.lock().unwrap();
        let price = state
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("No such price: {}", price_id)))?;
        let subscription = state.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            BillingError::SubscriptionNotFound(subscription_id.to_string())
        })?;
        subscription.price_id = price.id.clone();
        subscription.product_id = price.product_id.clone();
        subscription.amount_cents = price.amount_cents;
        subscription.interval = price.interval;
        Ok(subscription.clone())
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.state.lock().unwrap();
        let subscription = state.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            BillingError::SubscriptionNotFound(subscription_id.to_string())
        })?;
        subscription.cancel_at_period_end = cancel;
        Ok(subscription.clone())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.state.lock().unwrap();
        let subscription = state.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            BillingError::SubscriptionNotFound(subscription_id.to_string())
        })?;
        subscription.state = SubscriptionState::Canceled;
        Ok(subscription.clone())
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<ProviderPrice> {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("No such price: {}", price_id)))
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        self.state
            .lock()
            .unwrap()
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("No such product: {}", product_id)))
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderPaymentMethod>> {
        let state = self.state.lock().unwrap();
        if !state.customers.contains_key(customer_id) {
            return Err(BillingError::NotFound(format!(
                "No such customer: {}",
                customer_id
            )));
        }
        Ok(state
            .payment_methods
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentHandle> {
        let id = self.next("seti");
        Ok(SetupIntentHandle {
            client_secret: Some(format!("{}_secret_{}", id, customer_id)),
            id,
        })
    }
}
