//! Historical usage and trend reporting
//!
//! Derives the N most recent usage cycles for a user and summarizes them
//! into a trend: total words across cycles, average per cycle, and a
//! qualitative direction from comparing the two most recent cycles against
//! a threshold of 10% of the cycle average.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::cycles::historical_windows;
use crate::error::BillingResult;
use crate::provider::PaymentProvider;
use crate::store::BillingStore;
use crate::subscriptions::SubscriptionService;
use crate::usage::{UsageMeter, UsageReport};

/// Fraction of the cycle average below which a change counts as stable.
const TREND_THRESHOLD_RATIO: f64 = 0.10;

/// Qualitative usage direction across recent cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Summary across a set of usage cycles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAnalytics {
    pub total_words: i64,
    pub average_words_per_cycle: f64,
    pub trend: UsageTrend,
}

/// Historical usage: per-cycle reports plus the trend summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalUsage {
    /// Most recent first; index 0 is the current cycle.
    pub cycles: Vec<UsageReport>,
    pub trend: TrendAnalytics,
}

/// Service producing historical usage reports
#[derive(Clone)]
pub struct HistoryService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    prices: Arc<PriceIds>,
}

impl HistoryService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        prices: Arc<PriceIds>,
    ) -> Self {
        Self {
            provider,
            store,
            prices,
        }
    }

    /// Usage reports for the `cycle_count` most recent cycles of the user's
    /// canonical subscription, with the combined trend summary.
    pub async fn historical_usage(
        &self,
        user_id: Uuid,
        cycle_count: usize,
    ) -> BillingResult<HistoricalUsage> {
        let subscriptions = SubscriptionService::new(
            self.provider.clone(),
            self.store.clone(),
            self.prices.clone(),
        );
        let subscription = subscriptions.get_current_subscription(user_id).await?;

        let now = OffsetDateTime::now_utc();
        let windows = historical_windows(&subscription, cycle_count, now);

        let meter = UsageMeter::new(self.store.clone());
        let mut cycles = Vec::with_capacity(windows.len());
        for window in &windows {
            cycles.push(meter.report(user_id, window).await?);
        }

        let trend = classify_trend(&cycles);

        tracing::debug!(
            user_id = %user_id,
            cycle_count = cycles.len(),
            total_words = trend.total_words,
            trend = ?trend.trend,
            "Computed historical usage"
        );

        Ok(HistoricalUsage { cycles, trend })
    }
}

/// Classify the usage trend across cycles ordered most recent first.
///
/// The two most recent cycles are compared; a difference within 10% of the
/// per-cycle average counts as stable.
pub fn classify_trend(cycles: &[UsageReport]) -> TrendAnalytics {
    let total_words: i64 = cycles.iter().map(|c| c.total_word_count).sum();
    let average_words_per_cycle = if cycles.is_empty() {
        0.0
    } else {
        total_words as f64 / cycles.len() as f64
    };

    let trend = if cycles.len() < 2 {
        UsageTrend::Stable
    } else {
        let current = cycles[0].total_word_count as f64;
        let previous = cycles[1].total_word_count as f64;
        let threshold = average_words_per_cycle * TREND_THRESHOLD_RATIO;
        let delta = current - previous;
        if delta.abs() <= threshold {
            UsageTrend::Stable
        } else if delta > 0.0 {
            UsageTrend::Increasing
        } else {
            UsageTrend::Decreasing
        }
    };

    TrendAnalytics {
        total_words,
        average_words_per_cycle,
        trend,
    }
}
