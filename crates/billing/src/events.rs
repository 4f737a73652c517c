//! Append-only audit event log
//!
//! Every status transition and admin action lands here. Events answer "why
//! is this user in this state?", reconstruct billing history, and back the
//! admin dashboards. Rows are never mutated or deleted.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    SubscriptionPaused,
    CancellationScheduled,
    CheckoutCompleted,

    // Dunning cycle
    PaymentFailed,
    PaymentRecovered,
    GracePeriodStarted,
    Suspended,

    // Status management
    StatusChanged,
    Reactivated,
    AdminOverride,

    // Usage enforcement
    UsageBlocked,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            AuditEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            AuditEventType::SubscriptionDeleted => "SUBSCRIPTION_DELETED",
            AuditEventType::SubscriptionPaused => "SUBSCRIPTION_PAUSED",
            AuditEventType::CancellationScheduled => "CANCELLATION_SCHEDULED",
            AuditEventType::CheckoutCompleted => "CHECKOUT_COMPLETED",
            AuditEventType::PaymentFailed => "PAYMENT_FAILED",
            AuditEventType::PaymentRecovered => "PAYMENT_RECOVERED",
            AuditEventType::GracePeriodStarted => "GRACE_PERIOD_STARTED",
            AuditEventType::Suspended => "SUSPENDED",
            AuditEventType::StatusChanged => "STATUS_CHANGED",
            AuditEventType::Reactivated => "REACTIVATED",
            AuditEventType::AdminOverride => "ADMIN_OVERRIDE",
            AuditEventType::UsageBlocked => "USAGE_BLOCKED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the app
    User,
    /// Admin user
    Admin,
    /// System automation (sweeper, worker jobs)
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// A stored audit event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Builder for audit events
pub struct AuditEventBuilder {
    user_id: Uuid,
    event_type: AuditEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
    notes: Option<String>,
}

impl AuditEventBuilder {
    pub fn new(user_id: Uuid, event_type: AuditEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            actor_id: None,
            actor_type: ActorType::System,
            notes: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn stripe_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.stripe_customer_id = Some(customer_id.into());
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        self.actor_id = actor_id;
        self.actor_type = actor_type;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Append an audit event using any executor.
///
/// Generic over the executor so the status synchronizer can write the audit
/// row inside the same transaction as the user-record update.
pub async fn append<'e, E>(executor: E, builder: AuditEventBuilder) -> BillingResult<Uuid>
where
    E: sqlx::PgExecutor<'e>,
{
    let event_id: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO billing_events (
            user_id,
            event_type,
            event_data,
            stripe_event_id,
            stripe_subscription_id,
            stripe_customer_id,
            actor_id,
            actor_type,
            notes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(builder.user_id)
    .bind(builder.event_type.to_string())
    .bind(&builder.event_data)
    .bind(&builder.stripe_event_id)
    .bind(&builder.stripe_subscription_id)
    .bind(&builder.stripe_customer_id)
    .bind(builder.actor_id)
    .bind(builder.actor_type.to_string())
    .bind(&builder.notes)
    .fetch_one(executor)
    .await?;

    Ok(event_id.0)
}

/// Service for logging and querying audit events
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: AuditEventBuilder) -> BillingResult<Uuid> {
        append(&self.pool, builder).await
    }

    /// Recent events for a user, newest first.
    pub async fn recent_for_user(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<AuditEvent>> {
        let events: Vec<AuditEvent> = sqlx::query_as(
            r#"
            SELECT
                id, user_id, event_type, event_data,
                stripe_event_id, stripe_subscription_id, stripe_customer_id,
                actor_id, actor_type, notes, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_display() {
        assert_eq!(
            AuditEventType::SubscriptionCreated.to_string(),
            "SUBSCRIPTION_CREATED"
        );
        assert_eq!(AuditEventType::StatusChanged.to_string(), "STATUS_CHANGED");
        assert_eq!(
            AuditEventType::GracePeriodStarted.to_string(),
            "GRACE_PERIOD_STARTED"
        );
    }

    #[test]
    fn actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::Admin.to_string(), "admin");
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::Stripe.to_string(), "stripe");
    }

    #[test]
    fn builder_collects_fields() {
        let user_id = Uuid::new_v4();
        let admin_id = Uuid::new_v4();
        let builder = AuditEventBuilder::new(user_id, AuditEventType::AdminOverride)
            .data(serde_json::json!({"from": "suspended", "to": "free"}))
            .actor(admin_id, ActorType::Admin)
            .notes("manual reactivation");

        assert_eq!(builder.user_id, user_id);
        assert_eq!(builder.actor_id, Some(admin_id));
        assert_eq!(builder.actor_type, ActorType::Admin);
        assert_eq!(builder.notes.as_deref(), Some("manual reactivation"));
    }
}
