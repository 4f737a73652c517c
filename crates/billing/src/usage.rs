//! Daily chat usage counting and abuse detection
//!
//! One counter row per (user, local calendar day). The quota comes from the
//! access policy for the user's current status; the increment is a
//! single-row read-modify-write inside a transaction, so concurrent messages
//! for the same user-day cannot lose updates. A rolling-window burst
//! heuristic accumulates warnings and soft-blocks at three.

use kora_shared::{policy_for, AccessStatus};
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{self, ActorType, AuditEventBuilder, AuditEventType};

/// Rolling window for the burst heuristic.
pub const BURST_WINDOW_SECS: i64 = 60;

/// Messages inside the window before a user is flagged.
pub const BURST_LIMIT: usize = 10;

/// Warnings before the soft block engages.
pub const WARNINGS_TO_BLOCK: i32 = 3;

/// Why a message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The user's status grants no chat access.
    ChatDisabled,
    /// Daily quota used up.
    QuotaExceeded,
    /// Soft-blocked after accumulated abuse warnings.
    Blocked,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct UsageDecision {
    pub allowed: bool,
    pub remaining: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

/// Compute the user's local calendar day and the next local midnight.
///
/// The offset is the browser-reported UTC offset in minutes; out-of-range
/// values fall back to UTC.
pub fn local_day(now: OffsetDateTime, tz_offset_minutes: i32) -> (Date, OffsetDateTime) {
    let offset =
        UtcOffset::from_whole_seconds(tz_offset_minutes * 60).unwrap_or(UtcOffset::UTC);
    let local = now.to_offset(offset);
    let day = local.date();
    let next_day = day.next_day().unwrap_or(day);
    let reset_at = next_day.with_time(Time::MIDNIGHT).assume_offset(offset);
    (day, reset_at)
}

/// Count of timestamps still inside the rolling window, the new message
/// included.
pub fn burst_count(recent: &[OffsetDateTime], now: OffsetDateTime) -> usize {
    let window_start = now - Duration::seconds(BURST_WINDOW_SECS);
    recent.iter().filter(|t| **t >= window_start).count() + 1
}

/// Pure quota decision, separated from the storage plumbing.
pub fn decide(quota: i32, used: i32, blocked: bool) -> UsageDecision {
    if blocked {
        return UsageDecision {
            allowed: false,
            remaining: 0,
            reason: Some(DenyReason::Blocked),
        };
    }
    if quota == 0 {
        return UsageDecision {
            allowed: false,
            remaining: 0,
            reason: Some(DenyReason::ChatDisabled),
        };
    }
    if used >= quota {
        return UsageDecision {
            allowed: false,
            remaining: 0,
            reason: Some(DenyReason::QuotaExceeded),
        };
    }
    UsageDecision {
        allowed: true,
        remaining: quota - used - 1,
        reason: None,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    chat_messages: i32,
    warnings: i32,
    blocked: bool,
    recent_message_at: Vec<OffsetDateTime>,
}

/// Per-day usage counter
#[derive(Clone)]
pub struct UsageCounter {
    pool: PgPool,
}

impl UsageCounter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check the user's quota and, if allowed, count one message.
    pub async fn check_and_increment(&self, user_id: Uuid) -> BillingResult<UsageDecision> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let user: Option<(String, i32)> =
            sqlx::query_as("SELECT status, tz_offset_minutes FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (status_text, tz_offset_minutes) =
            user.ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        let status = AccessStatus::parse(&status_text).unwrap_or(AccessStatus::Free);
        let quota = policy_for(status).daily_message_quota;
        let (day, reset_at) = local_day(now, tz_offset_minutes);

        let row: Option<UsageRow> = sqlx::query_as(
            r#"
            SELECT chat_messages, warnings, blocked, recent_message_at
            FROM usage_days
            WHERE user_id = $1 AND day = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(day)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => {
                // First message of the local day. Warnings and the soft
                // block accumulate across days, so carry them forward.
                let carry: Option<(i32, bool)> = sqlx::query_as(
                    r#"
                    SELECT warnings, blocked FROM usage_days
                    WHERE user_id = $1
                    ORDER BY day DESC
                    LIMIT 1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
                let (warnings, blocked) = carry.unwrap_or((0, false));

                sqlx::query(
                    r#"
                    INSERT INTO usage_days (user_id, day, chat_messages, reset_at, warnings, blocked)
                    VALUES ($1, $2, 0, $3, $4, $5)
                    ON CONFLICT (user_id, day) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(day)
                .bind(reset_at)
                .bind(warnings)
                .bind(blocked)
                .execute(&mut *tx)
                .await?;

                UsageRow {
                    chat_messages: 0,
                    warnings,
                    blocked,
                    recent_message_at: Vec::new(),
                }
            }
        };

        let decision = decide(quota, row.chat_messages, row.blocked);
        if !decision.allowed {
            tx.commit().await?;
            return Ok(decision);
        }

        let new_count = row.chat_messages + 1;

        // Prune the rolling window and append this message.
        let window_start = now - Duration::seconds(BURST_WINDOW_SECS);
        let mut recent: Vec<OffsetDateTime> = row
            .recent_message_at
            .into_iter()
            .filter(|t| *t >= window_start)
            .collect();
        let burst = burst_count(&recent, now) > BURST_LIMIT;
        recent.push(now);

        // >150% of the daily quota is also treated as abusive, independent
        // of pacing.
        let overuse = i64::from(new_count) * 2 > i64::from(quota) * 3;

        let mut warnings = row.warnings;
        let mut blocked = row.blocked;
        if burst || overuse {
            warnings += 1;
            tracing::warn!(
                user_id = %user_id,
                burst = burst,
                overuse = overuse,
                warnings = warnings,
                "Abusive usage pattern detected"
            );
            if warnings >= WARNINGS_TO_BLOCK && !blocked {
                blocked = true;
                events::append(
                    &mut *tx,
                    AuditEventBuilder::new(user_id, AuditEventType::UsageBlocked)
                        .data(serde_json::json!({
                            "warnings": warnings,
                            "messages_today": new_count,
                        }))
                        .actor_type(ActorType::System),
                )
                .await?;
            }
        }

        sqlx::query(
            r#"
            UPDATE usage_days
            SET chat_messages = $3,
                recent_message_at = $4,
                warnings = $5,
                blocked = $6,
                updated_at = NOW()
            WHERE user_id = $1 AND day = $2
            "#,
        )
        .bind(user_id)
        .bind(day)
        .bind(new_count)
        .bind(&recent)
        .bind(warnings)
        .bind(blocked)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UsageDecision {
            allowed: true,
            remaining: quota - new_count,
            reason: None,
        })
    }

    /// Zero counters whose local midnight has passed. The per-day keying
    /// already isolates days; this keeps long-lived rows honest when a
    /// client keeps hitting an old day's row via clock skew.
    pub async fn reset_expired(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE usage_days
            SET chat_messages = 0, recent_message_at = '{}', updated_at = NOW()
            WHERE reset_at <= NOW() AND chat_messages > 0
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kora_shared::{GRACE_DAILY_QUOTA, PREMIUM_DAILY_QUOTA};
    use time::macros::datetime;

    #[test]
    fn local_day_respects_positive_offset() {
        // 23:30 UTC is already the next day at UTC+5:30.
        let now = datetime!(2025-03-10 23:30 UTC);
        let (day, reset_at) = local_day(now, 330);
        assert_eq!(day, time::macros::date!(2025-03-11));
        // Next local midnight is 2025-03-12 00:00 at +5:30.
        assert_eq!(reset_at, datetime!(2025-03-12 00:00 +5:30));
        assert!(reset_at > now);
    }

    #[test]
    fn local_day_respects_negative_offset() {
        // 02:00 UTC is still the previous day at UTC-8.
        let now = datetime!(2025-03-10 02:00 UTC);
        let (day, reset_at) = local_day(now, -480);
        assert_eq!(day, time::macros::date!(2025-03-09));
        assert_eq!(reset_at, datetime!(2025-03-10 00:00 -8:00));
        assert!(reset_at > now);
    }

    #[test]
    fn local_day_falls_back_to_utc_for_garbage_offsets() {
        let now = datetime!(2025-03-10 12:00 UTC);
        let (day, _) = local_day(now, 100_000);
        assert_eq!(day, time::macros::date!(2025-03-10));
    }

    #[test]
    fn free_user_has_zero_quota() {
        let decision = decide(0, 0, false);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reason, Some(DenyReason::ChatDisabled));
    }

    #[test]
    fn premium_messages_decrement_remaining_by_one() {
        let mut used = 0;
        for _ in 0..PREMIUM_DAILY_QUOTA {
            let decision = decide(PREMIUM_DAILY_QUOTA, used, false);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, PREMIUM_DAILY_QUOTA - used - 1);
            used += 1;
        }
        let decision = decide(PREMIUM_DAILY_QUOTA, used, false);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::QuotaExceeded));
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn grace_quota_is_reduced_but_nonzero() {
        let decision = decide(GRACE_DAILY_QUOTA, 0, false);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, GRACE_DAILY_QUOTA - 1);
    }

    #[test]
    fn blocked_user_is_rejected_regardless_of_quota() {
        let decision = decide(PREMIUM_DAILY_QUOTA, 0, true);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::Blocked));
    }

    #[test]
    fn eleventh_message_in_window_is_a_burst() {
        let now = datetime!(2025-03-10 12:00:00 UTC);
        // Ten messages in the last minute; this one makes eleven.
        let recent: Vec<OffsetDateTime> =
            (0..10).map(|i| now - Duration::seconds(i * 5)).collect();
        assert!(burst_count(&recent, now) > BURST_LIMIT);

        // Only five recent: fine.
        let sparse: Vec<OffsetDateTime> =
            (0..5).map(|i| now - Duration::seconds(i * 5)).collect();
        assert!(burst_count(&sparse, now) <= BURST_LIMIT);
    }

    #[test]
    fn old_messages_age_out_of_the_window() {
        let now = datetime!(2025-03-10 12:00:00 UTC);
        let stale: Vec<OffsetDateTime> =
            (0..20).map(|i| now - Duration::seconds(90 + i)).collect();
        assert_eq!(burst_count(&stale, now), 1);
    }
}
