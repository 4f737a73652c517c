//! Notification dispatch
//!
//! Resolves a template by notification kind, queues it in the
//! `notifications` table, and delivers it over the email service. Delivery
//! failures never propagate to the caller: the row stays queued with a
//! bounded retry budget, so the billing state machine does not depend on the
//! email subsystem being up.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::email::EmailService;
use crate::error::BillingResult;

/// Maximum delivery attempts per notification.
pub const MAX_ATTEMPTS: i32 = 3;

/// Notifications processed per retry batch.
pub const BATCH_SIZE: i64 = 10;

/// Kinds of notifications, one per template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Welcome,
    DunningGentle,
    DunningUrgent,
    DunningFinal,
    GraceStarted,
    Suspended,
    PaymentRecovered,
    Cancelled,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Welcome => "welcome",
            NotificationKind::DunningGentle => "dunning_gentle",
            NotificationKind::DunningUrgent => "dunning_urgent",
            NotificationKind::DunningFinal => "dunning_final",
            NotificationKind::GraceStarted => "grace_started",
            NotificationKind::Suspended => "suspended",
            NotificationKind::PaymentRecovered => "payment_recovered",
            NotificationKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "welcome" => Some(NotificationKind::Welcome),
            "dunning_gentle" => Some(NotificationKind::DunningGentle),
            "dunning_urgent" => Some(NotificationKind::DunningUrgent),
            "dunning_final" => Some(NotificationKind::DunningFinal),
            "grace_started" => Some(NotificationKind::GraceStarted),
            "suspended" => Some(NotificationKind::Suspended),
            "payment_recovered" => Some(NotificationKind::PaymentRecovered),
            "cancelled" => Some(NotificationKind::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Values substituted into templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateData {
    pub display_name: String,
    /// Link to the billing settings page.
    pub billing_url: String,
    /// Formatted date the grace period ends (dunning/grace templates).
    pub grace_ends_on: Option<String>,
    /// Formatted date access ends (cancellation template).
    pub access_ends_on: Option<String>,
}

/// A rendered email ready to queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body_html: String,
}

fn wrap(body: &str) -> String {
    format!(
        "<div style=\"font-family:sans-serif;max-width:560px;margin:0 auto\">{}\
         <p style=\"color:#888;font-size:12px\">Kora - your AI coach</p></div>",
        body
    )
}

/// Resolve a template. Pure string formatting, no I/O.
pub fn render(kind: NotificationKind, data: &TemplateData) -> RenderedEmail {
    let name = if data.display_name.is_empty() {
        "there"
    } else {
        &data.display_name
    };

    let (subject, body) = match kind {
        NotificationKind::Welcome => (
            "Welcome to Kora Premium".to_string(),
            format!(
                "<h2>Welcome aboard, {name}!</h2>\
                 <p>Your premium subscription is active. Your coach is ready \
                 whenever you are.</p>\
                 <p><a href=\"{url}\">Manage your subscription</a></p>",
                name = name,
                url = data.billing_url
            ),
        ),
        NotificationKind::DunningGentle => (
            "We couldn't process your payment".to_string(),
            format!(
                "<h2>Hi {name},</h2>\
                 <p>Your latest payment didn't go through. This is usually an \
                 expired card or a temporary bank hiccup - no action is lost, \
                 and your access continues while we retry.</p>\
                 <p><a href=\"{url}\">Update your payment method</a></p>",
                name = name,
                url = data.billing_url
            ),
        ),
        NotificationKind::DunningUrgent => (
            "Action needed: your Kora payment is still failing".to_string(),
            format!(
                "<h2>Hi {name},</h2>\
                 <p>We've tried several times to process your payment without \
                 success. Please update your payment method to keep your \
                 premium access.</p>\
                 <p><a href=\"{url}\">Update your payment method</a></p>",
                name = name,
                url = data.billing_url
            ),
        ),
        NotificationKind::DunningFinal => (
            "Final notice: your Kora subscription".to_string(),
            format!(
                "<h2>Hi {name},</h2>\
                 <p>We still couldn't collect your payment. Your account has \
                 entered a grace period with reduced access{until}. After \
                 that, your subscription will be suspended.</p>\
                 <p><a href=\"{url}\">Update your payment method now</a></p>",
                name = name,
                until = data
                    .grace_ends_on
                    .as_deref()
                    .map(|d| format!(" until {}", d))
                    .unwrap_or_default(),
                url = data.billing_url
            ),
        ),
        NotificationKind::GraceStarted => (
            "Your Kora grace period has started".to_string(),
            format!(
                "<h2>Hi {name},</h2>\
                 <p>You're in a grace period{until}. You keep limited access \
                 to your coach while you sort out payment.</p>\
                 <p><a href=\"{url}\">Go to billing settings</a></p>",
                name = name,
                until = data
                    .grace_ends_on
                    .as_deref()
                    .map(|d| format!(" ending {}", d))
                    .unwrap_or_default(),
                url = data.billing_url
            ),
        ),
        NotificationKind::Suspended => (
            "Your Kora subscription is suspended".to_string(),
            format!(
                "<h2>Hi {name},</h2>\
                 <p>Your grace period has ended and your subscription is now \
                 suspended. Your conversation history is safe. Contact \
                 support to reactivate your account.</p>\
                 <p><a href=\"{url}\">Billing settings</a></p>",
                name = name,
                url = data.billing_url
            ),
        ),
        NotificationKind::PaymentRecovered => (
            "You're all set - payment received".to_string(),
            format!(
                "<h2>Thanks, {name}!</h2>\
                 <p>Your payment went through and your premium access is fully \
                 restored. Welcome back.</p>",
                name = name
            ),
        ),
        NotificationKind::Cancelled => (
            "Your Kora subscription has been cancelled".to_string(),
            format!(
                "<h2>Hi {name},</h2>\
                 <p>Your subscription has been cancelled{until}. We'd love to \
                 hear what we could have done better - and you're welcome back \
                 any time.</p>",
                name = name,
                until = data
                    .access_ends_on
                    .as_deref()
                    .map(|d| format!("; your access continues until {}", d))
                    .unwrap_or_default()
            ),
        ),
    };

    RenderedEmail {
        subject,
        body_html: wrap(&body),
    }
}

/// Summary of one retry-processing pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NotifySummary {
    pub processed: usize,
    pub sent: usize,
    pub retried: usize,
    pub exhausted: usize,
}

#[derive(Debug, sqlx::FromRow)]
struct QueuedNotification {
    id: Uuid,
    recipient: String,
    subject: String,
    body_html: String,
    attempts: i32,
}

/// Queue-backed notification dispatcher
#[derive(Clone)]
pub struct NotificationDispatcher {
    pool: PgPool,
    email: EmailService,
}

impl NotificationDispatcher {
    pub fn new(pool: PgPool, email: EmailService) -> Self {
        Self { pool, email }
    }

    /// Render and queue a notification.
    ///
    /// Generic over the executor so the synchronizer can enqueue inside the
    /// same transaction as the status write.
    pub async fn enqueue<'e, E>(
        executor: E,
        user_id: Uuid,
        recipient: &str,
        kind: NotificationKind,
        data: &TemplateData,
    ) -> BillingResult<Uuid>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let rendered = render(kind, data);

        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (user_id, recipient, kind, subject, body_html)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(recipient)
        .bind(kind.as_str())
        .bind(&rendered.subject)
        .bind(&rendered.body_html)
        .fetch_one(executor)
        .await?;

        Ok(id.0)
    }

    /// Attempt delivery of one queued notification.
    ///
    /// The attempt is claimed atomically (attempts incremented up front), so
    /// an inline delivery and a concurrent worker pass cannot both send the
    /// same row. Returns true when the email went out.
    pub async fn try_deliver(&self, id: Uuid) -> bool {
        let row: Option<QueuedNotification> = match sqlx::query_as(
            r#"
            UPDATE notifications
            SET attempts = attempts + 1
            WHERE id = $1 AND status = 'pending' AND attempts < $2
            RETURNING id, recipient, subject, body_html, attempts
            "#,
        )
        .bind(id)
        .bind(MAX_ATTEMPTS)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(notification_id = %id, error = %e, "Failed to claim notification");
                return false;
            }
        };

        let Some(row) = row else {
            return false;
        };

        match self
            .email
            .send(&row.recipient, &row.subject, &row.body_html)
            .await
        {
            Ok(()) => {
                if let Err(e) = sqlx::query(
                    "UPDATE notifications SET status = 'sent', sent_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .execute(&self.pool)
                .await
                {
                    tracing::error!(
                        notification_id = %id,
                        error = %e,
                        "Notification delivered but could not be marked sent"
                    );
                }
                true
            }
            Err(e) => {
                let exhausted = row.attempts >= MAX_ATTEMPTS;
                let next_attempt =
                    OffsetDateTime::now_utc() + Duration::minutes(1 << row.attempts.min(6));
                let status = if exhausted { "failed" } else { "pending" };

                tracing::warn!(
                    notification_id = %id,
                    recipient = %row.recipient,
                    attempts = row.attempts,
                    exhausted = exhausted,
                    error = %e,
                    "Notification delivery failed"
                );

                if let Err(update_err) = sqlx::query(
                    r#"
                    UPDATE notifications
                    SET status = $1, last_error = $2, next_attempt_at = $3
                    WHERE id = $4
                    "#,
                )
                .bind(status)
                .bind(e.to_string())
                .bind(next_attempt)
                .bind(id)
                .execute(&self.pool)
                .await
                {
                    tracing::error!(
                        notification_id = %id,
                        error = %update_err,
                        "Failed to record notification delivery failure"
                    );
                }
                false
            }
        }
    }

    /// Process one batch of due notifications. Called by the worker every
    /// minute; each row is independent and one failure never aborts the pass.
    pub async fn process_pending(&self) -> BillingResult<NotifySummary> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM notifications
            WHERE status = 'pending' AND next_attempt_at <= NOW() AND attempts < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(MAX_ATTEMPTS)
        .bind(BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = NotifySummary {
            processed: due.len(),
            ..Default::default()
        };

        for (id,) in due {
            if self.try_deliver(id).await {
                summary.sent += 1;
            } else {
                // try_deliver already classified the failure; count terminal
                // rows separately for the job summary.
                let exhausted: Option<(String,)> =
                    sqlx::query_as("SELECT status FROM notifications WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .ok()
                        .flatten();
                match exhausted {
                    Some((status,)) if status == "failed" => summary.exhausted += 1,
                    _ => summary.retried += 1,
                }
            }
        }

        Ok(summary)
    }

    /// Delete terminal rows older than `keep_days`. Queue hygiene only; the
    /// audit trail lives in `billing_events`.
    pub async fn cleanup(&self, keep_days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE status IN ('sent', 'failed')
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

    fn data() -> TemplateData {
        TemplateData {
            display_name: "Maya".to_string(),
            billing_url: "https://app.kora.test/settings/billing".to_string(),
            grace_ends_on: Some("March 15".to_string()),
            access_ends_on: Some("April 1".to_string()),
        }
    }

    #[test]
    fn every_kind_renders_a_distinct_subject() {
        let kinds = [
            NotificationKind::Welcome,
            NotificationKind::DunningGentle,
            NotificationKind::DunningUrgent,
            NotificationKind::DunningFinal,
            NotificationKind::GraceStarted,
            NotificationKind::Suspended,
            NotificationKind::PaymentRecovered,
            NotificationKind::Cancelled,
        ];
        let data = data();
        let subjects: std::collections::HashSet<String> = kinds
            .iter()
            .map(|k| render(*k, &data).subject)
            .collect();
        assert_eq!(subjects.len(), kinds.len());
    }

    #[test]
    fn templates_address_the_user_by_name() {
        let rendered = render(NotificationKind::DunningGentle, &data());
        assert!(rendered.body_html.contains("Maya"));
        assert!(rendered.body_html.contains("Update your payment method"));
    }

    #[test]
    fn final_notice_includes_grace_deadline() {
        let rendered = render(NotificationKind::DunningFinal, &data());
        assert!(rendered.body_html.contains("March 15"));
        assert!(rendered.subject.contains("Final notice"));
    }

    #[test]
    fn cancellation_mentions_access_end_date() {
        let rendered = render(NotificationKind::Cancelled, &data());
        assert!(rendered.body_html.contains("April 1"));
    }

    #[test]
    fn missing_name_falls_back_to_greeting() {
        let rendered = render(
            NotificationKind::Welcome,
            &TemplateData {
                display_name: String::new(),
                billing_url: "https://app.kora.test/billing".to_string(),
                ..Default::default()
            },
        );
        assert!(rendered.body_html.contains("there"));
    }

    #[test]
    fn kind_round_trips_through_text() {
        for kind in [
            NotificationKind::Welcome,
            NotificationKind::DunningGentle,
            NotificationKind::DunningUrgent,
            NotificationKind::DunningFinal,
            NotificationKind::GraceStarted,
            NotificationKind::Suspended,
            NotificationKind::PaymentRecovered,
            NotificationKind::Cancelled,
        ] {
            assert_eq!(NotificationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(NotificationKind::parse("newsletter"), None);
    }
}
