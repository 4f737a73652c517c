//! Grace period sweeper
//!
//! Periodic job that suspends users whose grace window has elapsed. Each
//! user is handled independently; one failure never aborts the batch.
//! Overlapping runs are harmless: the synchronizer's writes are idempotent
//! by value, so two sweeps both applying `suspended` produce the same state.

use kora_shared::{AccessStatus, PaymentStatus};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::notify::NotificationKind;
use crate::sync::{StatusContext, StatusSynchronizer};

/// Summary of one sweep pass.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SweepSummary {
    pub examined: usize,
    pub suspended: usize,
    pub errors: usize,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiredGraceRow {
    id: Uuid,
    grace_period_ends_at: Option<OffsetDateTime>,
}

/// Sweeps expired grace periods into suspension
#[derive(Clone)]
pub struct GracePeriodSweeper {
    pool: PgPool,
    sync: StatusSynchronizer,
}

impl GracePeriodSweeper {
    pub fn new(pool: PgPool, sync: StatusSynchronizer) -> Self {
        Self { pool, sync }
    }

    /// One sweep pass. Safe to re-run: already-suspended users no longer
    /// match the query, and re-suspension is a no-op anyway.
    pub async fn sweep(&self) -> BillingResult<SweepSummary> {
        let expired: Vec<ExpiredGraceRow> = sqlx::query_as(
            r#"
            SELECT id, grace_period_ends_at
            FROM users
            WHERE status = 'grace_period'
              AND grace_period_ends_at <= NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SweepSummary {
            examined: expired.len(),
            ..Default::default()
        };

        for user in expired {
            let ctx = StatusContext::system()
                .with_payment_status(PaymentStatus::PastDue)
                .with_notification(NotificationKind::Suspended);

            match self
                .sync
                .apply_status(user.id, AccessStatus::Suspended, ctx)
                .await
            {
                Ok(_) => {
                    summary.suspended += 1;
                    tracing::warn!(
                        user_id = %user.id,
                        grace_ended_at = ?user.grace_period_ends_at,
                        "User suspended after grace period elapsed"
                    );
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        user_id = %user.id,
                        error = %e,
                        "Failed to suspend user after grace period"
                    );
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            suspended = summary.suspended,
            errors = summary.errors,
            "Grace period sweep complete"
        );

        Ok(summary)
    }
}
