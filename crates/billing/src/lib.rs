// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError variants carry provider context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Oratio Billing Module
//!
//! Handles Stripe integration for subscriptions, usage cycles, and plan
//! changes.
//!
//! ## Features
//!
//! - **Customer Resolution**: Map users to billing customers, heal broken
//!   or deleted mappings
//! - **Canonical Subscriptions**: Resolve a single canonical subscription
//!   per user, detecting provider-side duplicates
//! - **Usage Cycles**: Derive word-usage windows, including monthly
//!   sub-windows for annual plans
//! - **Usage Metering**: Aggregate recording word counts per cycle
//! - **History**: Per-cycle usage reports and trend classification
//! - **Plan Changes**: Immediate prorated upgrades, deferred downgrades,
//!   cancellation of scheduled changes
//! - **Invariants**: Executable consistency checks and explicit duplicate
//!   cleanup

pub mod client;
pub mod customer;
pub mod cycles;
pub mod error;
pub mod events;
pub mod history;
pub mod invariants;
pub mod plan_change;
pub mod provider;
pub mod store;
pub mod stripe_provider;
pub mod subscriptions;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod testing;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Cycles
pub use cycles::{historical_windows, usage_window_for, BillingCycleWindow};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// History
pub use history::{classify_trend, HistoricalUsage, HistoryService, TrendAnalytics, UsageTrend};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plan changes
pub use plan_change::{
    classify_change, prorated_charge_cents, ChangeTiming, PlanChangeOutcome, PlanChangePreview,
    PlanChangeService, PlanChangeType, ScheduledChange,
};

// Provider
pub use provider::{
    BillingInterval, PaymentProvider, ProviderCustomer, ProviderPaymentMethod, ProviderPrice,
    ProviderProduct, ProviderSubscription, SetupIntentHandle, SubscriptionState,
};

// Store
pub use store::{BillingStore, InMemoryStore, PostgresStore};

// Stripe provider
pub use stripe_provider::StripeProvider;

// Subscriptions
pub use subscriptions::SubscriptionService;

// Usage
pub use usage::{cycle_analytics, BillingCycleAnalytics, UsageMeter, UsageReport, UsageReportEntry};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

/// Current-cycle view combining the subscription, its usage report, and the
/// derived analytics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingCycleOverview {
    pub subscription: ProviderSubscription,
    pub usage: UsageReport,
    pub analytics: BillingCycleAnalytics,
}

/// Main billing service that combines all billing functionality
///
/// The provider and store are constructed once at startup and injected into
/// every component; nothing resolves them lazily per call.
pub struct BillingService {
    pub customer: CustomerService,
    pub subscriptions: SubscriptionService,
    pub usage: UsageMeter,
    pub history: HistoryService,
    pub plan_change: PlanChangeService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service with explicit collaborators
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        prices: Arc<PriceIds>,
    ) -> Self {
        Self {
            customer: CustomerService::new(provider.clone(), store.clone()),
            subscriptions: SubscriptionService::new(
                provider.clone(),
                store.clone(),
                prices.clone(),
            ),
            usage: UsageMeter::new(store.clone()),
            history: HistoryService::new(provider.clone(), store.clone(), prices.clone()),
            plan_change: PlanChangeService::new(provider.clone(), store.clone(), prices),
            invariants: InvariantChecker::new(provider, store),
        }
    }

    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let prices = Arc::new(stripe.price_ids().clone());
        let provider: Arc<dyn PaymentProvider> = Arc::new(StripeProvider::new(stripe));
        let store: Arc<dyn BillingStore> = Arc::new(PostgresStore::new(pool));
        Ok(Self::new(provider, store, prices))
    }

    /// The user's canonical subscription, creating the default free-tier
    /// subscription (and billing customer) if missing.
    pub async fn get_current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<ProviderSubscription> {
        self.subscriptions.get_current_subscription(user_id).await
    }

    /// Current-cycle usage and analytics for the user.
    pub async fn get_billing_cycle_analytics(
        &self,
        user_id: Uuid,
    ) -> BillingResult<BillingCycleOverview> {
        let subscription = self.subscriptions.get_current_subscription(user_id).await?;
        let word_limit = self.subscriptions.word_limit_for(&subscription).await?;

        let now = OffsetDateTime::now_utc();
        let window = usage_window_for(&subscription, now);
        let usage = self.usage.report(user_id, &window).await?;
        let analytics = cycle_analytics(&usage, word_limit, now);

        Ok(BillingCycleOverview {
            subscription,
            usage,
            analytics,
        })
    }

    /// Usage reports for the most recent cycles plus the trend summary.
    pub async fn get_historical_usage(
        &self,
        user_id: Uuid,
        cycle_count: usize,
    ) -> BillingResult<HistoricalUsage> {
        self.history.historical_usage(user_id, cycle_count).await
    }

    /// Preview a plan change without executing it.
    pub async fn preview_plan_change(
        &self,
        user_id: Uuid,
        new_price_id: &str,
    ) -> BillingResult<PlanChangePreview> {
        self.plan_change.preview(user_id, new_price_id).await
    }

    /// Execute a previewed plan change.
    pub async fn execute_plan_change(
        &self,
        user_id: Uuid,
        new_price_id: &str,
        change_type: PlanChangeType,
    ) -> BillingResult<PlanChangeOutcome> {
        self.plan_change
            .execute_plan_change(user_id, new_price_id, change_type)
            .await
    }

    /// Cancel a deferred plan change.
    pub async fn cancel_scheduled_change(
        &self,
        user_id: Uuid,
        scheduled_subscription_id: &str,
    ) -> BillingResult<()> {
        self.plan_change
            .cancel_scheduled_change(user_id, scheduled_subscription_id)
            .await
    }
}
