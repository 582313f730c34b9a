//! Billing persistence
//!
//! The billing core owns exactly two pieces of long-lived local state: the
//! customer-id/subscription-id pointers on the user record, and the
//! append-only recording (usage event) store. Everything else is derived on
//! demand from the provider.
//!
//! [`PostgresStore`] is the production backend; [`InMemoryStore`] backs
//! tests and single-node demo deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use oratio_shared::{Recording, User};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;

/// Storage operations used by the billing core.
///
/// Pointer writes are idempotent: persisting the same customer or
/// subscription id twice is a no-op, which is what makes concurrent
/// resolver/auditor calls for the same user safe.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>>;

    /// Persist the resolved billing customer id on the user record.
    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()>;

    /// Persist (or clear) the canonical subscription pointer.
    async fn set_canonical_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<()>;

    /// Users that have a billing customer id set. Used by the invariant
    /// checker to sweep for provider drift.
    async fn users_with_customer(&self) -> BillingResult<Vec<User>>;

    /// Append a usage event. Recordings are immutable once created.
    async fn insert_recording(&self, recording: &Recording) -> BillingResult<()>;

    /// Mark a recording inactive. Recordings are never deleted.
    async fn deactivate_recording(&self, recording_id: Uuid) -> BillingResult<()>;

    /// Active recordings for a user with `start <= created_at < end`,
    /// ordered ascending by creation time (ties broken by id).
    async fn recordings_in_window(
        &self,
        user_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Recording>>;

    /// Persist a billing audit event.
    async fn record_event(&self, event: &BillingEvent) -> BillingResult<()>;
}

// =============================================================================
// Postgres
// =============================================================================

/// Postgres-backed billing store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PostgresStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, name, stripe_customer_id, stripe_subscription_id,
                   created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE users SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("User {} not found", user_id)));
        }

        Ok(())
    }

    async fn set_canonical_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE users SET stripe_subscription_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(subscription_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("User {} not found", user_id)));
        }

        Ok(())
    }

    async fn users_with_customer(&self) -> BillingResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, name, stripe_customer_id, stripe_subscription_id,
                   created_at, updated_at
            FROM users
            WHERE stripe_customer_id IS NOT NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn insert_recording(&self, recording: &Recording) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO recordings (id, user_id, title, word_count, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(recording.id)
        .bind(recording.user_id)
        .bind(&recording.title)
        .bind(recording.word_count)
        .bind(recording.is_active)
        .bind(recording.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deactivate_recording(&self, recording_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("UPDATE recordings SET is_active = false WHERE id = $1")
            .bind(recording_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Recording {} not found",
                recording_id
            )));
        }

        Ok(())
    }

    async fn recordings_in_window(
        &self,
        user_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Recording>> {
        let recordings = sqlx::query_as::<_, Recording>(
            r#"
            SELECT id, user_id, title, word_count, is_active, created_at
            FROM recordings
            WHERE user_id = $1
              AND is_active = true
              AND created_at >= $2
              AND created_at < $3
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(recordings)
    }

    async fn record_event(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, user_id, event_type, data, actor_id, actor_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .bind(event.actor_id)
        .bind(event.actor_type.as_str())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    recordings: Vec<Recording>,
    events: Vec<BillingEvent>,
}

/// In-memory billing store
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }

    /// Insert a user record directly. User provisioning is owned by the
    /// auth layer in production; this exists for tests and demos.
    pub async fn seed_user(&self, user: User) {
        let mut state = self.state.write().await;
        state.users.insert(user.id, user);
    }

    /// Recorded billing events, oldest first.
    pub async fn events(&self) -> Vec<BillingEvent> {
        self.state.read().await.events.clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))?;
        user.stripe_customer_id = Some(customer_id.to_string());
        user.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn set_canonical_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))?;
        user.stripe_subscription_id = subscription_id.map(|s| s.to_string());
        user.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn users_with_customer(&self) -> BillingResult<Vec<User>> {
        let state = self.state.read().await;
        let mut users: Vec<User> = state
            .users
            .values()
            .filter(|u| u.stripe_customer_id.is_some())
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn insert_recording(&self, recording: &Recording) -> BillingResult<()> {
        let mut state = self.state.write().await;
        state.recordings.push(recording.clone());
        Ok(())
    }

    async fn deactivate_recording(&self, recording_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.write().await;
        let recording = state
            .recordings
            .iter_mut()
            .find(|r| r.id == recording_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("Recording {} not found", recording_id))
            })?;
        recording.is_active = false;
        Ok(())
    }

    async fn recordings_in_window(
        &self,
        user_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Recording>> {
        let state = self.state.read().await;
        let mut recordings: Vec<Recording> = state
            .recordings
            .iter()
            .filter(|r| {
                r.user_id == user_id && r.is_active && r.created_at >= start && r.created_at < end
            })
            .cloned()
            .collect();
        recordings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(recordings)
    }

    async fn record_event(&self, event: &BillingEvent) -> BillingResult<()> {
        let mut state = self.state.write().await;
        state.events.push(event.clone());
        Ok(())
    }
}
