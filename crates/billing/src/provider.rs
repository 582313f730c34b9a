//! Payment provider abstraction
//!
//! Typed data-transfer structures for every provider object the billing core
//! touches, plus the [`PaymentProvider`] trait that the Stripe client
//! implements. Internal logic never depends on raw provider payload shapes;
//! everything is validated into these structures at the boundary.
//!
//! The trait is also the seam where a second subscription-state source (the
//! mobile entitlement provider) would plug in.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Metadata key on the provider-side product that declares the word limit
/// per usage cycle for subscriptions on that product.
pub const WORD_LIMIT_METADATA_KEY: &str = "word_limit";

/// Metadata key marking a subscription as a deferred plan change.
pub const SCHEDULED_CHANGE_METADATA_KEY: &str = "scheduled_change";

/// Billing interval of a price or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle state as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionState {
    /// States that count as a usable, billable subscription.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing customer as known to the provider
///
/// The local user holds a weak reference (id + lookup) to this record; the
/// provider owns it and may delete it out from under us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
    pub created: OffsetDateTime,
    pub deleted: bool,
}

/// Subscription as known to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub state: SubscriptionState,
    pub price_id: String,
    pub product_id: Option<String>,
    /// Recurring amount in minor currency units (cents).
    pub amount_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub created: OffsetDateTime,
    pub metadata: HashMap<String, String>,
}

impl ProviderSubscription {
    /// Whether this subscription is a deferred plan change waiting for its
    /// start boundary (created by the plan change orchestrator).
    pub fn is_scheduled_change(&self) -> bool {
        self.metadata.contains_key(SCHEDULED_CHANGE_METADATA_KEY)
    }
}

/// Price as known to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPrice {
    pub id: String,
    pub product_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub active: bool,
}

/// Product as known to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProduct {
    pub id: String,
    pub name: String,
    pub metadata: HashMap<String, String>,
}

impl ProviderProduct {
    /// Declared word limit from product metadata, if present and parseable.
    pub fn word_limit(&self) -> Option<i64> {
        self.metadata
            .get(WORD_LIMIT_METADATA_KEY)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|limit| *limit > 0)
    }
}

/// A payment method attached to a customer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPaymentMethod {
    pub id: String,
    pub kind: String,
}

/// Reusable handle for completing payment setup out-of-band
///
/// Returned instead of a hard failure when a plan change needs a payment
/// method the customer does not have yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupIntentHandle {
    pub id: String,
    pub client_secret: Option<String>,
}

/// External payment provider operations used by the billing core.
///
/// One instance is constructed at startup and injected into each service;
/// tests substitute a fake. Implementations surface network/5xx failures as
/// [`crate::BillingError::TransientProvider`] and do not retry internally.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a new billing customer for a local user.
    async fn create_customer(
        &self,
        email: &str,
        user_id: Uuid,
    ) -> BillingResult<ProviderCustomer>;

    /// Retrieve a customer by id. Returns `None` when the provider reports
    /// the id as unknown; deletion is reported via the `deleted` flag.
    async fn retrieve_customer(&self, customer_id: &str)
        -> BillingResult<Option<ProviderCustomer>>;

    /// Look up a non-deleted customer by email.
    async fn find_customer_by_email(&self, email: &str)
        -> BillingResult<Option<ProviderCustomer>>;

    /// Create a subscription starting immediately.
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Create a subscription whose paid period starts at `start` (realized
    /// via the trial boundary). Used for deferred plan changes.
    async fn create_scheduled_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        start: OffsetDateTime,
        replaces_subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Retrieve a subscription by id, `None` when unknown.
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>>;

    /// All usable (active/trialing/past-due) subscriptions for a customer,
    /// excluding deferred plan changes. Errors with `NotFound` when the
    /// customer id itself is unknown to the provider.
    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>>;

    /// Deferred plan-change subscriptions for a customer (trialing with a
    /// future start boundary).
    async fn list_scheduled_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>>;

    /// Swap the subscription's price item in place, effective immediately.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        prorate: bool,
    ) -> BillingResult<ProviderSubscription>;

    /// Set or clear the cancel-at-period-end flag.
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription>;

    /// Cancel a subscription outright.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Retrieve a price by id.
    async fn retrieve_price(&self, price_id: &str) -> BillingResult<ProviderPrice>;

    /// Retrieve a product by id.
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct>;

    /// Payment methods usable for charging this customer.
    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderPaymentMethod>>;

    /// Create a setup-intent handle the customer can use to attach a
    /// payment method out-of-band.
    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentHandle>;
}
