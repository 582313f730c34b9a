//! Usage metering
//!
//! Aggregates recording word counts inside a billing cycle window and
//! derives the per-cycle analytics surfaced to the application.

use std::sync::Arc;

use oratio_shared::Recording;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cycles::BillingCycleWindow;
use crate::error::BillingResult;
use crate::store::BillingStore;

/// One recording inside a usage report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReportEntry {
    pub recording_id: Uuid,
    pub word_count: i32,
    pub created_at: OffsetDateTime,
    /// 1-based position in ascending creation order. Stable for identical
    /// input regardless of insertion order.
    pub order: u32,
}

/// Aggregated usage over a single window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub window: BillingCycleWindow,
    pub total_word_count: i64,
    pub recording_count: u32,
    pub first_recording_at: Option<OffsetDateTime>,
    pub last_recording_at: Option<OffsetDateTime>,
    pub recordings: Vec<UsageReportEntry>,
}

/// Current-cycle analytics derived from a usage report and the plan's word
/// limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingCycleAnalytics {
    pub word_limit: i64,
    pub usage_percentage: f64,
    pub remaining_words: i64,
    pub has_exceeded_limit: bool,
    pub days_remaining: i64,
}

/// Usage meter over the append-only recording store
#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn BillingStore>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Aggregate active recordings for `user_id` inside `window`.
    ///
    /// An empty window produces a zero report, not an error.
    pub async fn report(
        &self,
        user_id: Uuid,
        window: &BillingCycleWindow,
    ) -> BillingResult<UsageReport> {
        let mut recordings = self
            .store
            .recordings_in_window(user_id, window.start, window.end)
            .await?;

        // The store orders ascending already; re-sort for determinism in
        // case a backend returns equal timestamps in arbitrary order.
        recordings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let total_word_count = recordings.iter().map(|r| r.word_count as i64).sum();
        let entries: Vec<UsageReportEntry> = recordings
            .iter()
            .enumerate()
            .map(|(i, r)| UsageReportEntry {
                recording_id: r.id,
                word_count: r.word_count,
                created_at: r.created_at,
                order: (i + 1) as u32,
            })
            .collect();

        Ok(UsageReport {
            window: window.clone(),
            total_word_count,
            recording_count: entries.len() as u32,
            first_recording_at: entries.first().map(|e| e.created_at),
            last_recording_at: entries.last().map(|e| e.created_at),
            recordings: entries,
        })
    }

    /// Append a usage event.
    pub async fn record_recording(
        &self,
        user_id: Uuid,
        title: Option<String>,
        word_count: i32,
    ) -> BillingResult<Recording> {
        let recording = Recording {
            id: Uuid::new_v4(),
            user_id,
            title,
            word_count,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };

        self.store.insert_recording(&recording).await?;

        tracing::debug!(
            user_id = %user_id,
            recording_id = %recording.id,
            word_count = word_count,
            "Recorded usage event"
        );

        Ok(recording)
    }

    /// Mark a recording inactive; it stops counting toward usage but is
    /// never deleted.
    pub async fn deactivate_recording(&self, recording_id: Uuid) -> BillingResult<()> {
        self.store.deactivate_recording(recording_id).await
    }
}

/// Derive the current-cycle analytics from a report and the plan word limit.
pub fn cycle_analytics(
    report: &UsageReport,
    word_limit: i64,
    now: OffsetDateTime,
) -> BillingCycleAnalytics {
    let usage_percentage = if word_limit > 0 {
        (report.total_word_count as f64 / word_limit as f64) * 100.0
    } else {
        0.0
    };

    BillingCycleAnalytics {
        word_limit,
        usage_percentage,
        remaining_words: (word_limit - report.total_word_count).max(0),
        has_exceeded_limit: report.total_word_count > word_limit,
        days_remaining: report.window.days_remaining(now),
    }
}
