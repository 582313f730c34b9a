//! Billing cycle windows
//!
//! Pure derivation of word-usage windows from a subscription's raw period
//! boundaries. Monthly plans track usage over the billing period itself;
//! annual plans track usage over monthly sub-windows anchored on the
//! day-of-month the subscription period started.
//!
//! Windows are half-open `[start, end)`, never persisted, and recomputed
//! fresh for every query since "now" advances.

use serde::{Deserialize, Serialize};
use time::util::days_in_year_month;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::provider::{BillingInterval, ProviderSubscription};

/// A half-open usage window `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCycleWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl BillingCycleWindow {
    /// Whether `t` falls inside the window. Start is inclusive, end exclusive.
    pub fn contains(&self, t: OffsetDateTime) -> bool {
        self.start <= t && t < self.end
    }

    /// Total length of the window in whole days.
    pub fn total_days(&self) -> i64 {
        (self.end - self.start).whole_days()
    }

    /// Days until the window closes, rounded up, never negative.
    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        if now >= self.end {
            return 0;
        }
        let seconds = (self.end - now).whole_seconds();
        (seconds as f64 / 86_400.0).ceil() as i64
    }
}

/// Step `count` calendar months backwards from `(year, month)`.
fn months_back(year: i32, month: Month, count: usize) -> (i32, Month) {
    let mut year = year;
    let mut month = month;
    for _ in 0..count {
        if month == Month::January {
            year -= 1;
        }
        month = month.previous();
    }
    (year, month)
}

/// Step `count` calendar months forwards from `(year, month)`.
fn months_forward(year: i32, month: Month, count: usize) -> (i32, Month) {
    let mut year = year;
    let mut month = month;
    for _ in 0..count {
        if month == Month::December {
            year += 1;
        }
        month = month.next();
    }
    (year, month)
}

/// The anchor boundary instant for a given month: the anchor day clamped to
/// the last valid day of that month (day 31 in a 30-day month lands on the
/// 30th, never rolls into the next month), at the boundary's time of day.
fn anchor_instant(year: i32, month: Month, anchor_day: u8, boundary_time: Time) -> OffsetDateTime {
    let last = days_in_year_month(year, month);
    let day = anchor_day.min(last).max(1);
    // Day is clamped into the month's valid range, so this cannot fail
    let date = Date::from_calendar_date(year, month, day).unwrap_or(Date::MIN);
    PrimitiveDateTime::new(date, boundary_time).assume_utc()
}

/// The word-usage window for a subscription at `now`.
///
/// Monthly interval: the raw current billing period. Annual interval: the
/// monthly sub-window derived from the anchor day of the period start.
pub fn usage_window_for(
    subscription: &ProviderSubscription,
    now: OffsetDateTime,
) -> BillingCycleWindow {
    match subscription.interval {
        BillingInterval::Month => BillingCycleWindow {
            start: subscription.current_period_start,
            end: subscription.current_period_end,
        },
        BillingInterval::Year => {
            let anchor = subscription.current_period_start.to_offset(UtcOffset::UTC);
            let anchor_day = anchor.day();
            let boundary_time = anchor.time();
            let now_utc = now.to_offset(UtcOffset::UTC);

            // Compare against the anchor day as it lands in this month: an
            // anchor of 31 is the 28th in February, and the 28th must open
            // the new sub-window there.
            let effective_anchor = anchor_day.min(days_in_year_month(now_utc.year(), now_utc.month()));
            let (mut year, mut month) = (now_utc.year(), now_utc.month());
            if now_utc.day() < effective_anchor {
                let stepped = months_back(year, month, 1);
                year = stepped.0;
                month = stepped.1;
            }
            let mut start = anchor_instant(year, month, anchor_day, boundary_time);

            // The day comparison ignores the boundary's time of day; correct
            // so that `now` always falls inside the returned half-open window.
            if start > now_utc {
                let (py, pm) = months_back(start.year(), start.month(), 1);
                start = anchor_instant(py, pm, anchor_day, boundary_time);
            }
            let (ny, nm) = months_forward(start.year(), start.month(), 1);
            let mut end = anchor_instant(ny, nm, anchor_day, boundary_time);
            if end <= now_utc {
                start = end;
                let (ny2, nm2) = months_forward(start.year(), start.month(), 1);
                end = anchor_instant(ny2, nm2, anchor_day, boundary_time);
            }

            BillingCycleWindow { start, end }
        }
    }
}

/// The `count` most recent usage windows, most recent first (index 0 is the
/// current cycle). Adjacent windows share a boundary: each prior window ends
/// exactly where its successor starts, so the set is contiguous and
/// non-overlapping.
pub fn historical_windows(
    subscription: &ProviderSubscription,
    count: usize,
    now: OffsetDateTime,
) -> Vec<BillingCycleWindow> {
    if count == 0 {
        return Vec::new();
    }

    let current = usage_window_for(subscription, now);
    let anchor = subscription.current_period_start.to_offset(UtcOffset::UTC);
    let anchor_day = anchor.day();
    let boundary_time = current.start.to_offset(UtcOffset::UTC).time();

    let base_year = current.start.to_offset(UtcOffset::UTC).year();
    let base_month = current.start.to_offset(UtcOffset::UTC).month();

    let mut windows = Vec::with_capacity(count);
    let mut next_start = current.start;
    windows.push(current);

    for i in 1..count {
        let (year, month) = months_back(base_year, base_month, i);
        let start = anchor_instant(year, month, anchor_day, boundary_time);
        windows.push(BillingCycleWindow {
            start,
            end: next_start,
        });
        next_start = start;
    }

    windows
}
