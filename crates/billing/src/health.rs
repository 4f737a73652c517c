//! Payment health checks
//!
//! Runnable consistency checks over the billing state. Each check is a real
//! SQL query, reads only, and reports enough context to debug a violation.
//! Backs the admin `payment_health_check` action and can be run after any
//! webhook replay.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single health check violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthViolation {
    /// Which check was violated
    pub check: String,
    /// Affected user(s), where applicable
    pub user_ids: Vec<Uuid>,
    /// Human-readable description
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: Severity,
}

/// Severity of a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Users may have wrong access right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full health check run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<HealthViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct UserStatusRow {
    id: Uuid,
    email: String,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct BacklogRow {
    user_id: Uuid,
    attempts: i32,
    last_error: Option<String>,
}

/// Service for running billing health checks
#[derive(Clone)]
pub struct HealthChecker {
    pool: PgPool,
}

impl HealthChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<HealthSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_grace_has_deadline().await?);
        violations.extend(self.check_premium_has_no_dunning_fields().await?);
        violations.extend(self.check_no_stuck_ledger_claims().await?);
        violations.extend(self.check_claims_outbox_backlog().await?);
        violations.extend(self.check_notification_backlog().await?);
        violations.extend(self.check_suspended_payment_mismatch().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.check)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(HealthSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// A grace_period user must have a grace deadline set. Without one the
    /// sweeper can never suspend them.
    async fn check_grace_has_deadline(&self) -> BillingResult<Vec<HealthViolation>> {
        let rows: Vec<UserStatusRow> = sqlx::query_as(
            r#"
            SELECT id, email, status
            FROM users
            WHERE status = 'grace_period'
              AND grace_period_ends_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HealthViolation {
                check: "grace_has_deadline".to_string(),
                user_ids: vec![row.id],
                description: "User is in grace_period with no grace deadline".to_string(),
                context: serde_json::json!({ "email": row.email }),
                severity: Severity::Critical,
            })
            .collect())
    }

    /// A premium user must carry no dunning leftovers.
    async fn check_premium_has_no_dunning_fields(&self) -> BillingResult<Vec<HealthViolation>> {
        let rows: Vec<UserStatusRow> = sqlx::query_as(
            r#"
            SELECT id, email, status
            FROM users
            WHERE status = 'premium'
              AND (payment_failed_at IS NOT NULL OR grace_period_ends_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HealthViolation {
                check: "premium_has_no_dunning_fields".to_string(),
                user_ids: vec![row.id],
                description: "Premium user still has dunning fields set".to_string(),
                context: serde_json::json!({ "email": row.email }),
                severity: Severity::High,
            })
            .collect())
    }

    /// Ledger rows stuck in `processing` past the reclaim timeout indicate
    /// a crashed handler whose event was never finalized.
    async fn check_no_stuck_ledger_claims(&self) -> BillingResult<Vec<HealthViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM webhook_events
            WHERE status = 'processing'
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HealthViolation {
                check: "no_stuck_ledger_claims".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event {} stuck in processing since {}",
                    row.stripe_event_id, row.processing_started_at
                ),
                context: serde_json::json!({
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at.to_string(),
                }),
                severity: Severity::High,
            })
            .collect())
    }

    /// Claims-outbox rows that exhausted their retries mean the claims store
    /// disagrees with the document store for those users.
    async fn check_claims_outbox_backlog(&self) -> BillingResult<Vec<HealthViolation>> {
        let rows: Vec<BacklogRow> = sqlx::query_as(
            r#"
            SELECT user_id, attempts, last_error
            FROM claims_outbox
            WHERE status = 'failed'
               OR (status = 'pending' AND created_at < NOW() - INTERVAL '1 hour')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HealthViolation {
                check: "claims_outbox_backlog".to_string(),
                user_ids: vec![row.user_id],
                description: "Claims-store update undelivered; token claims may be stale"
                    .to_string(),
                context: serde_json::json!({
                    "attempts": row.attempts,
                    "last_error": row.last_error,
                }),
                severity: Severity::High,
            })
            .collect())
    }

    /// Notifications that exhausted their retry budget.
    async fn check_notification_backlog(&self) -> BillingResult<Vec<HealthViolation>> {
        let rows: Vec<BacklogRow> = sqlx::query_as(
            r#"
            SELECT user_id, attempts, last_error
            FROM notifications
            WHERE status = 'failed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HealthViolation {
                check: "notification_backlog".to_string(),
                user_ids: vec![row.user_id],
                description: "Notification exhausted its delivery retries".to_string(),
                context: serde_json::json!({
                    "attempts": row.attempts,
                    "last_error": row.last_error,
                }),
                severity: Severity::Medium,
            })
            .collect())
    }

    /// A suspended user with an active payment status usually means a
    /// recovery event was missed or applied out of order.
    async fn check_suspended_payment_mismatch(&self) -> BillingResult<Vec<HealthViolation>> {
        let rows: Vec<UserStatusRow> = sqlx::query_as(
            r#"
            SELECT id, email, status
            FROM users
            WHERE status = 'suspended'
              AND payment_status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HealthViolation {
                check: "suspended_payment_mismatch".to_string(),
                user_ids: vec![row.id],
                description: "Suspended user has an active payment status".to_string(),
                context: serde_json::json!({ "email": row.email }),
                severity: Severity::Medium,
            })
            .collect())
    }

    /// Run a single check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<HealthViolation>> {
        match name {
            "grace_has_deadline" => self.check_grace_has_deadline().await,
            "premium_has_no_dunning_fields" => self.check_premium_has_no_dunning_fields().await,
            "no_stuck_ledger_claims" => self.check_no_stuck_ledger_claims().await,
            "claims_outbox_backlog" => self.check_claims_outbox_backlog().await,
            "notification_backlog" => self.check_notification_backlog().await,
            "suspended_payment_mismatch" => self.check_suspended_payment_mismatch().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "grace_has_deadline",
            "premium_has_no_dunning_fields",
            "no_stuck_ledger_claims",
            "claims_outbox_backlog",
            "notification_backlog",
            "suspended_payment_mismatch",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display() {
        assert_eq!(Severity::Critical.to_string(), "CRITICAL");
        assert_eq!(Severity::High.to_string(), "HIGH");
        assert_eq!(Severity::Medium.to_string(), "MEDIUM");
        assert_eq!(Severity::Low.to_string(), "LOW");
    }

    #[test]
    fn available_checks_cover_all_stores() {
        let checks = HealthChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"grace_has_deadline"));
        assert!(checks.contains(&"claims_outbox_backlog"));
        assert!(checks.contains(&"no_stuck_ledger_claims"));
    }
}
