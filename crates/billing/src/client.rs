//! Stripe client configuration
//!
//! The client is constructed once at startup and injected into the provider
//! implementation; a missing secret is fatal at construction time, never at
//! request time.

use std::sync::Arc;

use oratio_shared::PlanTier;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingInterval;

/// Stripe price IDs for each plan tier and billing interval
#[derive(Debug, Clone)]
pub struct PriceIds {
    /// Free tier price (a zero-amount recurring price). Required: the
    /// default subscription created for new users lives on this price.
    pub free: String,
    pub pro_monthly: Option<String>,
    pub pro_annual: Option<String>,
    pub premium_monthly: Option<String>,
    pub premium_annual: Option<String>,
}

impl PriceIds {
    pub fn from_env() -> BillingResult<Self> {
        let free = std::env::var("STRIPE_PRICE_FREE")
            .map_err(|_| BillingError::Config("STRIPE_PRICE_FREE not set".to_string()))?;

        Ok(Self {
            free,
            pro_monthly: std::env::var("STRIPE_PRICE_PRO_MONTHLY").ok(),
            pro_annual: std::env::var("STRIPE_PRICE_PRO_ANNUAL").ok(),
            premium_monthly: std::env::var("STRIPE_PRICE_PREMIUM_MONTHLY").ok(),
            premium_annual: std::env::var("STRIPE_PRICE_PREMIUM_ANNUAL").ok(),
        })
    }

    /// Price id for a tier and interval, if configured.
    pub fn price_id_for(&self, tier: PlanTier, interval: BillingInterval) -> Option<&str> {
        match (tier, interval) {
            (PlanTier::Free, _) => Some(self.free.as_str()),
            (PlanTier::Pro, BillingInterval::Month) => self.pro_monthly.as_deref(),
            (PlanTier::Pro, BillingInterval::Year) => self.pro_annual.as_deref(),
            (PlanTier::Premium, BillingInterval::Month) => self.premium_monthly.as_deref(),
            (PlanTier::Premium, BillingInterval::Year) => self.premium_annual.as_deref(),
        }
    }

    /// Reverse lookup: which tier and interval a configured price id maps to.
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<(PlanTier, BillingInterval)> {
        let candidates = [
            (Some(self.free.as_str()), PlanTier::Free, BillingInterval::Month),
            (self.pro_monthly.as_deref(), PlanTier::Pro, BillingInterval::Month),
            (self.pro_annual.as_deref(), PlanTier::Pro, BillingInterval::Year),
            (
                self.premium_monthly.as_deref(),
                PlanTier::Premium,
                BillingInterval::Month,
            ),
            (
                self.premium_annual.as_deref(),
                PlanTier::Premium,
                BillingInterval::Year,
            ),
        ];
        candidates
            .into_iter()
            .find(|(id, _, _)| *id == Some(price_id))
            .map(|(_, tier, interval)| (tier, interval))
    }
}

/// Stripe configuration loaded from environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        if secret_key.trim().is_empty() {
            return Err(BillingError::Config("STRIPE_SECRET_KEY is empty".to_string()));
        }

        Ok(Self {
            secret_key,
            price_ids: PriceIds::from_env()?,
        })
    }
}

/// Thin wrapper owning the Stripe API client and its configuration
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(&config.secret_key);
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn price_ids(&self) -> &PriceIds {
        &self.config.price_ids
    }
}
