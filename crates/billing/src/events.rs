//! Billing event logging
//!
//! Structured audit trail for billing mutations and provider anomalies.
//! Event logging must never fail a billing operation: callers log a warning
//! and continue when persistence fails.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingStore;

/// Billing event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    CustomerCreated,
    CustomerRecovered,
    SubscriptionCreated,
    DuplicateSubscriptionsDetected,
    PlanChangeScheduled,
    PlanChangeExecuted,
    ScheduledChangeCancelled,
    DuplicateSubscriptionsCleaned,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerCreated => "customer_created",
            Self::CustomerRecovered => "customer_recovered",
            Self::SubscriptionCreated => "subscription_created",
            Self::DuplicateSubscriptionsDetected => "duplicate_subscriptions_detected",
            Self::PlanChangeScheduled => "plan_change_scheduled",
            Self::PlanChangeExecuted => "plan_change_executed",
            Self::ScheduledChangeCancelled => "scheduled_change_cancelled",
            Self::DuplicateSubscriptionsCleaned => "duplicate_subscriptions_cleaned",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who triggered a billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Operator,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Operator => "operator",
            Self::System => "system",
        }
    }
}

/// A recorded billing event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: BillingEventType,
    pub data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub created_at: OffsetDateTime,
}

/// Builder for billing events
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            data: serde_json::Value::Null,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    fn build(self) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            event_type: self.event_type,
            data: self.data,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Service for persisting billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        let event = builder.build();
        tracing::debug!(
            user_id = %event.user_id,
            event_type = %event.event_type,
            "Recording billing event"
        );
        self.store.record_event(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        assert_eq!(
            BillingEventType::DuplicateSubscriptionsDetected.as_str(),
            "duplicate_subscriptions_detected"
        );
        assert_eq!(BillingEventType::PlanChangeScheduled.as_str(), "plan_change_scheduled");
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let event = BillingEventBuilder::new(Uuid::new_v4(), BillingEventType::CustomerCreated)
            .data(serde_json::json!({"customer_id": "cus_123"}))
            .build();
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.actor_id.is_none());
        assert_eq!(event.data["customer_id"], "cus_123");
    }
}
