//! Idempotent webhook event ledger
//!
//! One row per inbound Stripe event id. `begin_processing` atomically claims
//! exclusive processing rights with `INSERT ... ON CONFLICT ... RETURNING`,
//! so two concurrent deliveries of the same event cannot both pass an EXISTS
//! check and double-apply side effects. Terminal state is written by the same
//! handler invocation; rows stuck in `processing` become reclaimable after a
//! timeout instead of wedging the event forever.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Minutes after which a `processing` claim is considered abandoned.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Outcome of attempting to claim an event for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginOutcome {
    /// True when a terminal (or live) record already exists: the caller must
    /// skip all side effects.
    pub already_processed: bool,
}

/// A failed event eligible for manual replay.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedEvent {
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Ledger of processed webhook event ids
#[derive(Clone)]
pub struct EventLedger {
    pool: PgPool,
}

impl EventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim an event id for processing.
    ///
    /// The insert succeeds (returns a row) only for the first delivery, or
    /// for a delivery that found the previous claim stuck in `processing`
    /// past the timeout. Everything else is a duplicate.
    pub async fn begin_processing(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        payload: &serde_json::Value,
    ) -> BillingResult<BeginOutcome> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (stripe_event_id, event_type, event_timestamp, payload, status, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                status = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Reclaimed stuck claim at ', NOW()::TEXT)
            WHERE webhook_events.status = 'processing'
              AND webhook_events.processing_started_at < NOW() - ($5 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(payload)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e)
        })?;

        if claimed.is_some() {
            return Ok(BeginOutcome {
                already_processed: false,
            });
        }

        // Lost the claim. Log why, for operator visibility.
        let existing_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM webhook_events WHERE stripe_event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten();

        let reason = match existing_status {
            Some((ref s,)) if s == "completed" => "already completed",
            Some((ref s,)) if s == "processing" => "being processed by another invocation",
            Some(_) => "exists in another state",
            None => "unknown (race condition?)",
        };

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            reason = %reason,
            "Duplicate webhook event"
        );

        Ok(BeginOutcome {
            already_processed: true,
        })
    }

    /// Mark the event completed.
    pub async fn complete(&self, event_id: &str, result: &str) -> BillingResult<()> {
        self.finish(event_id, "completed", Some(result), None).await
    }

    /// Mark the event failed, keeping it eligible for manual replay.
    pub async fn fail(&self, event_id: &str, error: &str) -> BillingResult<()> {
        self.finish(event_id, "failed", None, Some(error)).await
    }

    async fn finish(
        &self,
        event_id: &str,
        status: &str,
        result: Option<&str>,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let update = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $1, result = $2, error_message = $3
            WHERE stripe_event_id = $4
            "#,
        )
        .bind(status)
        .bind(result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = update {
            // Retry once. The terminal state is what makes redelivery a
            // no-op, so losing it matters more than most writes.
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to finalize ledger record failed, retrying"
            );

            sqlx::query(
                r#"
                UPDATE webhook_events
                SET status = $1, result = $2, error_message = $3
                WHERE stripe_event_id = $4
                "#,
            )
            .bind(status)
            .bind(result)
            .bind(error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|retry_err| {
                tracing::error!(
                    event_id = %event_id,
                    target_status = %status,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to finalize ledger record after retry; event may appear stuck in 'processing'"
                );
                BillingError::Database(retry_err)
            })?;
        }

        Ok(())
    }

    /// Events marked failed, oldest first, for admin-triggered replay.
    pub async fn failed_events(&self, limit: i64) -> BillingResult<Vec<FailedEvent>> {
        let events: Vec<FailedEvent> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, payload, error_message, created_at
            FROM webhook_events
            WHERE status = 'failed'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
