//! User status synchronization
//!
//! The only writer of the billing/access fields on the user record. A status
//! change commits the record update, the audit row, the claims-outbox row,
//! and the queued notification in one database transaction; delivery to the
//! claims store and the email provider then runs through the outbox (an
//! immediate attempt inline, worker retries after that). A crash between
//! commit and delivery is recovered by the worker instead of leaving the
//! stores silently inconsistent.

use kora_shared::{can_transition, AccessStatus, ApprovalType, PaymentStatus};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::claims::ClaimsClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{self, ActorType, AuditEventBuilder, AuditEventType};
use crate::notify::{NotificationDispatcher, NotificationKind, TemplateData};

/// Maximum claims-store delivery attempts per outbox row.
pub const CLAIMS_MAX_ATTEMPTS: i32 = 5;

/// Outbox rows processed per worker pass.
pub const CLAIMS_BATCH_SIZE: i64 = 10;

/// Context accompanying a status change.
#[derive(Debug, Clone)]
pub struct StatusContext {
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub approval: ApprovalType,
    /// Mirror of the processor's subscription status; None keeps the stored
    /// value.
    pub payment_status: Option<PaymentStatus>,
    pub notification: Option<NotificationKind>,
    pub reason: Option<String>,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    /// Stripe event-creation time. Events older than the user's
    /// `last_event_at` are skipped (last-writer-wins by logical time, not
    /// arrival time).
    pub event_time: Option<OffsetDateTime>,
    /// Required when entering grace_period.
    pub grace_period_ends_at: Option<OffsetDateTime>,
    /// First-failure time for a new dunning cycle; only applied when the
    /// stored value is null.
    pub payment_failed_at: Option<OffsetDateTime>,
    /// Override for the derived audit event type.
    pub audit_event: Option<AuditEventType>,
}

impl StatusContext {
    /// Context for a Stripe-webhook-driven change.
    pub fn stripe(event_id: impl Into<String>, event_time: OffsetDateTime) -> Self {
        Self {
            actor_id: None,
            actor_type: ActorType::Stripe,
            approval: ApprovalType::Stripe,
            payment_status: None,
            notification: None,
            reason: None,
            stripe_event_id: Some(event_id.into()),
            stripe_subscription_id: None,
            event_time: Some(event_time),
            grace_period_ends_at: None,
            payment_failed_at: None,
            audit_event: None,
        }
    }

    /// Context for system automation (sweeper, jobs).
    pub fn system() -> Self {
        Self {
            actor_id: None,
            actor_type: ActorType::System,
            approval: ApprovalType::Stripe,
            payment_status: None,
            notification: None,
            reason: None,
            stripe_event_id: None,
            stripe_subscription_id: None,
            event_time: None,
            grace_period_ends_at: None,
            payment_failed_at: None,
            audit_event: None,
        }
    }

    /// Context for an admin-initiated change.
    pub fn admin(actor_id: Uuid, reason: Option<String>) -> Self {
        Self {
            actor_id: Some(actor_id),
            actor_type: ActorType::Admin,
            approval: ApprovalType::Admin,
            payment_status: None,
            notification: None,
            reason,
            stripe_event_id: None,
            stripe_subscription_id: None,
            event_time: None,
            grace_period_ends_at: None,
            payment_failed_at: None,
            audit_event: Some(AuditEventType::AdminOverride),
        }
    }

    pub fn with_notification(mut self, kind: NotificationKind) -> Self {
        self.notification = Some(kind);
        self
    }

    pub fn with_payment_status(mut self, status: PaymentStatus) -> Self {
        self.payment_status = Some(status);
        self
    }

    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_grace_deadline(mut self, deadline: OffsetDateTime) -> Self {
        self.grace_period_ends_at = Some(deadline);
        self
    }

    pub fn with_payment_failed_at(mut self, at: OffsetDateTime) -> Self {
        self.payment_failed_at = Some(at);
        self
    }

    pub fn with_audit_event(mut self, event: AuditEventType) -> Self {
        self.audit_event = Some(event);
        self
    }
}

/// Result of applying a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The event was older than the last applied one and was ignored.
    SkippedStale,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    display_name: Option<String>,
    status: String,
    last_event_at: Option<OffsetDateTime>,
    grace_period_ends_at: Option<OffsetDateTime>,
    payment_failed_at: Option<OffsetDateTime>,
}

/// Summary of one claims-outbox processing pass.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct OutboxSummary {
    pub processed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub exhausted: usize,
}

/// Derive the audit event type for a transition.
fn audit_event_for(from: AccessStatus, to: AccessStatus) -> AuditEventType {
    use AccessStatus::*;
    match (from, to) {
        (_, GracePeriod) => AuditEventType::GracePeriodStarted,
        (_, Suspended) => AuditEventType::Suspended,
        (Suspended, Free) => AuditEventType::Reactivated,
        (PastDue | GracePeriod, Premium) => AuditEventType::PaymentRecovered,
        (_, PastDue) => AuditEventType::PaymentFailed,
        (Free, Premium) => AuditEventType::SubscriptionCreated,
        (_, Free) => AuditEventType::SubscriptionDeleted,
        _ => AuditEventType::StatusChanged,
    }
}

fn format_day(dt: OffsetDateTime) -> String {
    let description = time::macros::format_description!("[month repr:long] [day padding:none]");
    dt.format(description)
        .unwrap_or_else(|_| dt.date().to_string())
}

/// Applies status decisions to the user record, the claims store, the
/// notification queue, and the audit log.
#[derive(Clone)]
pub struct StatusSynchronizer {
    pool: PgPool,
    claims: ClaimsClient,
    notify: NotificationDispatcher,
    billing_url: String,
}

impl StatusSynchronizer {
    pub fn new(
        pool: PgPool,
        claims: ClaimsClient,
        notify: NotificationDispatcher,
        billing_url: String,
    ) -> Self {
        Self {
            pool,
            claims,
            notify,
            billing_url,
        }
    }

    /// Apply a status to a user.
    ///
    /// Validates the transition, writes everything transactionally, then
    /// drives the outbox inline. Side-effect delivery failures are retried
    /// by the worker and never fail this call.
    pub async fn apply_status(
        &self,
        user_id: Uuid,
        new_status: AccessStatus,
        ctx: StatusContext,
    ) -> BillingResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;

        let user: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, email, display_name, status, last_event_at,
                   grace_period_ends_at, payment_failed_at
            FROM users
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let user = user.ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        // Ordering guard: an event created before the last applied one must
        // not overwrite newer state, whatever order Stripe delivered them in.
        if let (Some(event_time), Some(last_applied)) = (ctx.event_time, user.last_event_at) {
            if event_time < last_applied {
                tracing::info!(
                    user_id = %user_id,
                    event_time = %event_time,
                    last_applied = %last_applied,
                    "Ignoring stale webhook event"
                );
                return Ok(ApplyOutcome::SkippedStale);
            }
        }

        let current = AccessStatus::parse(&user.status).unwrap_or(AccessStatus::Free);
        if !can_transition(current, new_status) {
            return Err(BillingError::IllegalTransition {
                from: current,
                to: new_status,
            });
        }

        // Dunning-field rules: premium and free clear both; grace carries its
        // deadline; past_due records the first failure of the cycle.
        let (grace_ends, payment_failed) = match new_status {
            AccessStatus::Premium | AccessStatus::Free => (None, None),
            AccessStatus::GracePeriod => (
                ctx.grace_period_ends_at.or(user.grace_period_ends_at),
                user.payment_failed_at.or(ctx.payment_failed_at),
            ),
            AccessStatus::PastDue => (
                None,
                user.payment_failed_at
                    .or(ctx.payment_failed_at)
                    .or_else(|| Some(OffsetDateTime::now_utc())),
            ),
            AccessStatus::Suspended => (None, user.payment_failed_at),
        };

        sqlx::query(
            r#"
            UPDATE users
            SET status = $2,
                payment_status = COALESCE($3, payment_status),
                approval_type = $4,
                grace_period_ends_at = $5,
                payment_failed_at = $6,
                last_event_at = COALESCE($7, last_event_at),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(new_status.as_str())
        .bind(ctx.payment_status.map(|s| s.as_str()))
        .bind(ctx.approval.as_str())
        .bind(grace_ends)
        .bind(payment_failed)
        .bind(ctx.event_time)
        .execute(&mut *tx)
        .await?;

        // Audit row, same transaction.
        let audit_type = ctx
            .audit_event
            .unwrap_or_else(|| audit_event_for(current, new_status));
        let mut builder = AuditEventBuilder::new(user_id, audit_type)
            .data(serde_json::json!({
                "from_status": current.as_str(),
                "to_status": new_status.as_str(),
                "grace_period_ends_at": grace_ends.map(|d| d.to_string()),
            }))
            .actor_opt(ctx.actor_id, ctx.actor_type);
        if let Some(event_id) = &ctx.stripe_event_id {
            builder = builder.stripe_event(event_id);
        }
        if let Some(sub_id) = &ctx.stripe_subscription_id {
            builder = builder.stripe_subscription(sub_id);
        }
        if let Some(reason) = &ctx.reason {
            builder = builder.notes(reason);
        }
        events::append(&mut *tx, builder).await?;

        // Claims-outbox row, same transaction.
        let claims_row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO claims_outbox (user_id, status_value)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(new_status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        // Notification, same transaction.
        let notification_id = if let Some(kind) = ctx.notification {
            let data = TemplateData {
                display_name: user.display_name.clone().unwrap_or_default(),
                billing_url: self.billing_url.clone(),
                grace_ends_on: grace_ends.map(format_day),
                access_ends_on: None,
            };
            Some(
                NotificationDispatcher::enqueue(&mut *tx, user_id, &user.email, kind, &data)
                    .await?,
            )
        } else {
            None
        };

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            from_status = %current,
            to_status = %new_status,
            actor_type = %ctx.actor_type,
            "User status applied"
        );

        // Inline fast path; the worker picks up whatever this misses.
        self.deliver_claims_row(claims_row.0).await;
        if let Some(id) = notification_id {
            self.notify.try_deliver(id).await;
        }

        Ok(ApplyOutcome::Applied)
    }

    /// Attempt delivery of one claims-outbox row. The attempt is claimed
    /// atomically, so the inline path and the worker cannot double-deliver.
    pub async fn deliver_claims_row(&self, id: Uuid) -> bool {
        let row: Option<(Uuid, String, i32)> = match sqlx::query_as(
            r#"
            UPDATE claims_outbox
            SET attempts = attempts + 1
            WHERE id = $1 AND status = 'pending' AND attempts < $2
            RETURNING user_id, status_value, attempts
            "#,
        )
        .bind(id)
        .bind(CLAIMS_MAX_ATTEMPTS)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(outbox_id = %id, error = %e, "Failed to claim outbox row");
                return false;
            }
        };

        let Some((user_id, status_value, attempts)) = row else {
            return false;
        };

        let Some(status) = AccessStatus::parse(&status_value) else {
            tracing::error!(outbox_id = %id, status_value = %status_value, "Unparseable outbox status");
            let _ = sqlx::query(
                "UPDATE claims_outbox SET status = 'failed', last_error = 'unparseable status' WHERE id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await;
            return false;
        };

        match self.claims.update_status(user_id, status).await {
            Ok(()) => {
                if let Err(e) = sqlx::query(
                    "UPDATE claims_outbox SET status = 'done', done_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .execute(&self.pool)
                .await
                {
                    tracing::error!(
                        outbox_id = %id,
                        error = %e,
                        "Claims delivered but outbox row could not be marked done"
                    );
                }
                true
            }
            Err(e) => {
                let exhausted = attempts >= CLAIMS_MAX_ATTEMPTS;
                let next_attempt =
                    OffsetDateTime::now_utc() + Duration::minutes(1 << attempts.min(6));
                let new_state = if exhausted { "failed" } else { "pending" };

                tracing::warn!(
                    outbox_id = %id,
                    user_id = %user_id,
                    attempts = attempts,
                    exhausted = exhausted,
                    error = %e,
                    "Claims store delivery failed"
                );

                let _ = sqlx::query(
                    r#"
                    UPDATE claims_outbox
                    SET status = $1, last_error = $2, next_attempt_at = $3
                    WHERE id = $4
                    "#,
                )
                .bind(new_state)
                .bind(e.to_string())
                .bind(next_attempt)
                .bind(id)
                .execute(&self.pool)
                .await;
                false
            }
        }
    }

    /// Process one batch of due claims-outbox rows. Called by the worker.
    pub async fn process_claims_outbox(&self) -> BillingResult<OutboxSummary> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM claims_outbox
            WHERE status = 'pending' AND next_attempt_at <= NOW() AND attempts < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(CLAIMS_MAX_ATTEMPTS)
        .bind(CLAIMS_BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = OutboxSummary {
            processed: due.len(),
            ..Default::default()
        };

        for (id,) in due {
            if self.deliver_claims_row(id).await {
                summary.delivered += 1;
            } else {
                let state: Option<(String,)> =
                    sqlx::query_as("SELECT status FROM claims_outbox WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .ok()
                        .flatten();
                match state {
                    Some((s,)) if s == "failed" => summary.exhausted += 1,
                    _ => summary.retried += 1,
                }
            }
        }

        Ok(summary)
    }

    /// Delete terminal outbox rows older than `keep_days`.
    pub async fn cleanup_outbox(&self, keep_days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM claims_outbox
            WHERE status IN ('done', 'failed')
              AND created_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(keep_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn audit_event_derivation_follows_the_lifecycle() {
        use AccessStatus::*;
        assert_eq!(
            audit_event_for(Free, Premium),
            AuditEventType::SubscriptionCreated
        );
        assert_eq!(
            audit_event_for(Premium, PastDue),
            AuditEventType::PaymentFailed
        );
        assert_eq!(
            audit_event_for(PastDue, Premium),
            AuditEventType::PaymentRecovered
        );
        assert_eq!(
            audit_event_for(GracePeriod, Premium),
            AuditEventType::PaymentRecovered
        );
        assert_eq!(
            audit_event_for(PastDue, GracePeriod),
            AuditEventType::GracePeriodStarted
        );
        assert_eq!(
            audit_event_for(GracePeriod, Suspended),
            AuditEventType::Suspended
        );
        assert_eq!(
            audit_event_for(Suspended, Free),
            AuditEventType::Reactivated
        );
        assert_eq!(
            audit_event_for(Premium, Free),
            AuditEventType::SubscriptionDeleted
        );
    }

    #[test]
    fn day_formatting_is_human_readable() {
        assert_eq!(format_day(datetime!(2025-03-15 09:30 UTC)), "March 15");
        assert_eq!(format_day(datetime!(2025-12-01 00:00 UTC)), "December 1");
    }

    #[test]
    fn stripe_context_carries_ordering_guard() {
        let at = datetime!(2025-06-01 00:00 UTC);
        let ctx = StatusContext::stripe("evt_123", at);
        assert_eq!(ctx.event_time, Some(at));
        assert_eq!(ctx.approval, ApprovalType::Stripe);
        assert_eq!(ctx.stripe_event_id.as_deref(), Some("evt_123"));
    }

    #[test]
    fn admin_context_forces_admin_audit_event() {
        let ctx = StatusContext::admin(Uuid::new_v4(), Some("support ticket".into()));
        assert_eq!(ctx.audit_event, Some(AuditEventType::AdminOverride));
        assert_eq!(ctx.approval, ApprovalType::Admin);
    }
}
