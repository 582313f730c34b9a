// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Core
//!
//! Tests critical boundary conditions in:
//! - Cycle windows (CYC-01 to CYC-06)
//! - Proration (PRO-01 to PRO-04)
//! - Trend classification (TRD-01 to TRD-03)
//! - End-to-end flows over the service facade (E2E-01 to E2E-03)

#[cfg(test)]
mod cycle_window_tests {
    use std::collections::HashMap;

    use time::macros::datetime;
    use time::OffsetDateTime;

    use crate::cycles::{historical_windows, usage_window_for};
    use crate::provider::{BillingInterval, ProviderSubscription, SubscriptionState};

    fn annual_subscription(period_start: OffsetDateTime) -> ProviderSubscription {
        ProviderSubscription {
            id: "sub_annual".to_string(),
            customer_id: "cus_annual".to_string(),
            state: SubscriptionState::Active,
            price_id: "price_pro_y".to_string(),
            product_id: Some("prod_pro".to_string()),
            amount_cents: 14_400,
            currency: "usd".to_string(),
            interval: BillingInterval::Year,
            current_period_start: period_start,
            current_period_end: period_start + time::Duration::days(365),
            cancel_at_period_end: false,
            trial_end: None,
            created: period_start,
            metadata: HashMap::new(),
        }
    }

    // =========================================================================
    // CYC-01: Window crossing a year boundary
    // =========================================================================
    #[test]
    fn test_window_crosses_year_boundary() {
        let sub = annual_subscription(datetime!(2025-03-26 00:00 UTC));
        let window = usage_window_for(&sub, datetime!(2026-01-10 00:00 UTC));
        assert_eq!(window.start, datetime!(2025-12-26 00:00 UTC));
        assert_eq!(window.end, datetime!(2026-01-26 00:00 UTC));
    }

    // =========================================================================
    // CYC-02: Anchor day 31 in a leap-year February clamps to the 29th
    // =========================================================================
    #[test]
    fn test_leap_year_february_clamps_to_29() {
        let sub = annual_subscription(datetime!(2023-08-31 00:00 UTC));
        let window = usage_window_for(&sub, datetime!(2024-02-10 00:00 UTC));
        assert_eq!(window.start, datetime!(2024-01-31 00:00 UTC));
        assert_eq!(window.end, datetime!(2024-02-29 00:00 UTC));

        let window = usage_window_for(&sub, datetime!(2024-03-05 00:00 UTC));
        assert_eq!(window.start, datetime!(2024-02-29 00:00 UTC));
        assert_eq!(window.end, datetime!(2024-03-31 00:00 UTC));
    }

    // =========================================================================
    // CYC-03: Anchor day 1 never clamps
    // =========================================================================
    #[test]
    fn test_anchor_day_one() {
        let sub = annual_subscription(datetime!(2025-05-01 00:00 UTC));
        let window = usage_window_for(&sub, datetime!(2026-02-14 00:00 UTC));
        assert_eq!(window.start, datetime!(2026-02-01 00:00 UTC));
        assert_eq!(window.end, datetime!(2026-03-01 00:00 UTC));
    }

    // =========================================================================
    // CYC-04: Exactly on the boundary instant opens the new window
    // =========================================================================
    #[test]
    fn test_boundary_instant_belongs_to_new_window() {
        let sub = annual_subscription(datetime!(2025-05-20 08:00 UTC));
        let window = usage_window_for(&sub, datetime!(2026-02-20 08:00 UTC));
        assert_eq!(window.start, datetime!(2026-02-20 08:00 UTC));
        assert!(window.contains(datetime!(2026-02-20 08:00 UTC)));
    }

    // =========================================================================
    // CYC-05: Historical windows across a year boundary stay contiguous
    // =========================================================================
    #[test]
    fn test_historical_windows_across_year_boundary() {
        let sub = annual_subscription(datetime!(2025-03-26 00:00 UTC));
        let windows = historical_windows(&sub, 6, datetime!(2026-02-10 00:00 UTC));

        assert_eq!(windows.len(), 6);
        for i in 1..windows.len() {
            assert_eq!(windows[i].end, windows[i - 1].start);
        }
        assert_eq!(windows[0].start, datetime!(2026-01-26 00:00 UTC));
        assert_eq!(windows[5].start, datetime!(2025-08-26 00:00 UTC));
    }

    // =========================================================================
    // CYC-06: Requesting more history than the subscription age still
    // yields well-formed windows
    // =========================================================================
    #[test]
    fn test_history_beyond_subscription_start() {
        let sub = annual_subscription(datetime!(2025-11-26 00:00 UTC));
        let windows = historical_windows(&sub, 24, datetime!(2026-01-10 00:00 UTC));
        assert_eq!(windows.len(), 24);
        for window in &windows {
            assert!(window.start < window.end);
        }
    }
}

#[cfg(test)]
mod proration_tests {
    use crate::plan_change::prorated_charge_cents;

    // =========================================================================
    // PRO-01: Rounding goes to the nearest cent
    // =========================================================================
    #[test]
    fn test_rounding_to_nearest_cent() {
        // 1000 * 1/3 = 333.33 rounds down
        assert_eq!(prorated_charge_cents(1000, 10, 30), 333);
        // 1000 * 2/3 = 666.67 rounds up
        assert_eq!(prorated_charge_cents(1000, 20, 30), 667);
    }

    // =========================================================================
    // PRO-02: Single-day periods
    // =========================================================================
    #[test]
    fn test_single_day_period() {
        assert_eq!(prorated_charge_cents(3000, 1, 1), 3000);
    }

    // =========================================================================
    // PRO-03: The result is never negative
    // =========================================================================
    #[test]
    fn test_never_negative() {
        assert_eq!(prorated_charge_cents(-2000, 10, 30), 0);
        assert_eq!(prorated_charge_cents(2000, -5, 30), 0);
        assert_eq!(prorated_charge_cents(2000, 10, -30), 0);
    }

    // =========================================================================
    // PRO-04: Tiny deltas round to zero rather than a minimum charge
    // =========================================================================
    #[test]
    fn test_tiny_delta_rounds_to_zero() {
        assert_eq!(prorated_charge_cents(1, 1, 30), 0);
    }
}

#[cfg(test)]
mod trend_tests {
    use time::macros::datetime;

    use crate::cycles::BillingCycleWindow;
    use crate::history::{classify_trend, UsageTrend};
    use crate::usage::UsageReport;

    fn report(total: i64) -> UsageReport {
        UsageReport {
            window: BillingCycleWindow {
                start: datetime!(2026-01-01 00:00 UTC),
                end: datetime!(2026-02-01 00:00 UTC),
            },
            total_word_count: total,
            recording_count: 0,
            first_recording_at: None,
            last_recording_at: None,
            recordings: Vec::new(),
        }
    }

    // =========================================================================
    // TRD-01: Usage appearing from nothing is increasing
    // =========================================================================
    #[test]
    fn test_usage_from_zero_is_increasing() {
        let analytics = classify_trend(&[report(900), report(0), report(0)]);
        assert_eq!(analytics.trend, UsageTrend::Increasing);
    }

    // =========================================================================
    // TRD-02: Usage dropping to nothing is decreasing
    // =========================================================================
    #[test]
    fn test_usage_to_zero_is_decreasing() {
        let analytics = classify_trend(&[report(0), report(900), report(0)]);
        assert_eq!(analytics.trend, UsageTrend::Decreasing);
    }

    // =========================================================================
    // TRD-03: Older cycles do not affect the direction, only the threshold
    // =========================================================================
    #[test]
    fn test_direction_uses_two_most_recent_cycles() {
        // Large historical usage raises the average so the recent delta of
        // 200 falls inside the 10% band
        let analytics = classify_trend(&[report(1100), report(900), report(10_000)]);
        assert_eq!(analytics.trend, UsageTrend::Stable);
    }
}

#[cfg(test)]
mod facade_tests {
    use std::sync::Arc;

    use oratio_shared::User;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::client::PriceIds;
    use crate::provider::BillingInterval;
    use crate::store::{BillingStore, InMemoryStore};
    use crate::testing::FakeProvider;
    use crate::{BillingService, PlanChangeOutcome, PlanChangeType};

    fn test_prices() -> Arc<PriceIds> {
        Arc::new(PriceIds {
            free: "price_free".to_string(),
            pro_monthly: Some("price_pro_m".to_string()),
            pro_annual: Some("price_pro_y".to_string()),
            premium_monthly: None,
            premium_annual: None,
        })
    }

    fn build_service() -> (Arc<FakeProvider>, Arc<InMemoryStore>, BillingService) {
        let provider = Arc::new(FakeProvider::new());
        provider.add_product("prod_free", "Oratio Free", Some(500));
        provider.add_product("prod_pro", "Oratio Pro", Some(10_000));
        provider.add_price("price_free", "prod_free", 0, BillingInterval::Month);
        provider.add_price("price_pro_m", "prod_pro", 1500, BillingInterval::Month);
        let store = Arc::new(InMemoryStore::new());
        let service = BillingService::new(provider.clone(), store.clone(), test_prices());
        (provider, store, service)
    }

    async fn seed_user(store: &InMemoryStore) -> Uuid {
        let user_id = Uuid::new_v4();
        store
            .seed_user(User {
                id: user_id,
                email: "amara@example.com".to_string(),
                name: Some("Amara".to_string()),
                stripe_customer_id: None,
                stripe_subscription_id: None,
                created_at: OffsetDateTime::now_utc(),
                updated_at: OffsetDateTime::now_utc(),
            })
            .await;
        user_id
    }

    // =========================================================================
    // E2E-01: Fresh user bootstrap is idempotent across the facade
    // =========================================================================
    #[tokio::test]
    async fn test_fresh_user_bootstrap() {
        crate::testing::init_test_tracing();
        let (provider, store, service) = build_service();
        let user_id = seed_user(&store).await;

        let first = service.get_current_subscription(user_id).await.unwrap();
        let second = service.get_current_subscription(user_id).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.price_id, "price_free");
        assert_eq!(provider.customer_count(), 1);
        assert_eq!(provider.subscription_count(), 1);
    }

    // =========================================================================
    // E2E-02: Usage flows into cycle analytics with the metadata word limit
    // =========================================================================
    #[tokio::test]
    async fn test_usage_flows_into_analytics() {
        let (_provider, store, service) = build_service();
        let user_id = seed_user(&store).await;

        // Bootstrap the subscription, then record usage inside the period
        service.get_current_subscription(user_id).await.unwrap();
        service
            .usage
            .record_recording(user_id, Some("standup".to_string()), 120)
            .await
            .unwrap();
        service
            .usage
            .record_recording(user_id, Some("all-hands".to_string()), 280)
            .await
            .unwrap();

        let overview = service.get_billing_cycle_analytics(user_id).await.unwrap();
        assert_eq!(overview.usage.total_word_count, 400);
        assert_eq!(overview.usage.recording_count, 2);
        assert_eq!(overview.analytics.word_limit, 500);
        assert_eq!(overview.analytics.remaining_words, 100);
        assert!(!overview.analytics.has_exceeded_limit);
        assert!((overview.analytics.usage_percentage - 80.0).abs() < 0.001);

        let orders: Vec<u32> = overview.usage.recordings.iter().map(|e| e.order).collect();
        assert_eq!(orders, vec![1, 2]);
    }

    // =========================================================================
    // E2E-03: Upgrade then history: the upgraded price shows up and the
    // deferred-change listing stays empty
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_then_history() {
        let (provider, store, service) = build_service();
        let user_id = seed_user(&store).await;

        service.get_current_subscription(user_id).await.unwrap();
        let user = store.get_user(user_id).await.unwrap().unwrap();
        provider.add_payment_method(user.stripe_customer_id.as_deref().unwrap());

        let preview = service
            .preview_plan_change(user_id, "price_pro_m")
            .await
            .unwrap();
        assert_eq!(preview.change_type, PlanChangeType::Upgrade);

        let outcome = service
            .execute_plan_change(user_id, "price_pro_m", PlanChangeType::Upgrade)
            .await
            .unwrap();
        assert!(matches!(outcome, PlanChangeOutcome::Upgraded { .. }));

        let current = service.get_current_subscription(user_id).await.unwrap();
        assert_eq!(current.price_id, "price_pro_m");

        let history = service.get_historical_usage(user_id, 3).await.unwrap();
        assert_eq!(history.cycles.len(), 3);

        let pending = service
            .plan_change
            .list_scheduled_changes(user_id)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }
}
