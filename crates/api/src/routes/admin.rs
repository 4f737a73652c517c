//! Admin endpoint
//!
//! Single action-dispatch endpoint gated by the caller's `is_admin` flag.
//! Status edits route through the status synchronizer like every other
//! writer, so the claims store and audit log stay consistent with the
//! document store.

use axum::{
    extract::{Extension, State},
    Json,
};
use kora_shared::{can_transition, AccessStatus, PaymentStatus};
use serde::Deserialize;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use kora_billing::subscriptions::payment_status_from;
use kora_billing::{ApplyOutcome, NotificationKind, StatusContext};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Admin action request
#[derive(Debug, Deserialize)]
pub struct AdminActionRequest {
    pub action: String,
    pub user_id: Option<Uuid>,
    /// Target status for `process_user_status`.
    pub status: Option<String>,
    pub reason: Option<String>,
    /// Recipient override for `test_email`.
    pub email: Option<String>,
    /// Batch size for `retry_failed_webhooks`.
    pub limit: Option<i64>,
    /// Grace window override (days) for `process_user_status`.
    pub grace_days: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct GraceReportRow {
    id: Uuid,
    email: String,
    grace_period_ends_at: Option<OffsetDateTime>,
    payment_failed_at: Option<OffsetDateTime>,
}

/// POST /admin
pub async fn dispatch_action(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AdminActionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        action = %req.action,
        target_user = ?req.user_id,
        "Admin action"
    );

    match req.action.as_str() {
        "test_email" => test_email(&state, &auth_user, &req).await,
        "process_user_status" => process_user_status(&state, &auth_user, &req).await,
        "sync_stripe_status" => sync_stripe_status(&state, &auth_user, &req).await,
        "grace_period_report" => grace_period_report(&state).await,
        "payment_health_check" => payment_health_check(&state).await,
        "retry_failed_webhooks" => retry_failed_webhooks(&state, &req).await,
        other => Err(ApiError::BadRequest(format!("Unknown action: {other}"))),
    }
}

async fn test_email(
    state: &AppState,
    auth_user: &AuthUser,
    req: &AdminActionRequest,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state.billing_service()?;

    let recipient = req
        .email
        .clone()
        .or_else(|| auth_user.email.clone())
        .ok_or_else(|| ApiError::BadRequest("No recipient email available".to_string()))?;

    billing
        .email
        .send(
            &recipient,
            "Kora email delivery test",
            "<p>This is a test email from the Kora billing backend.</p>",
        )
        .await?;

    Ok(Json(json!({
        "sent": true,
        "recipient": recipient,
        "email_enabled": billing.email.is_enabled(),
    })))
}

async fn process_user_status(
    state: &AppState,
    auth_user: &AuthUser,
    req: &AdminActionRequest,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state.billing_service()?;

    let user_id = req
        .user_id
        .ok_or_else(|| ApiError::BadRequest("user_id is required".to_string()))?;
    let status_text = req
        .status
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("status is required".to_string()))?;
    let status = AccessStatus::parse(status_text)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown status: {status_text}")))?;

    let mut ctx = StatusContext::admin(auth_user.user_id, req.reason.clone());
    match status {
        AccessStatus::GracePeriod => {
            // Admin-granted or extended grace window.
            let deadline =
                OffsetDateTime::now_utc() + Duration::days(req.grace_days.unwrap_or(7));
            ctx = ctx
                .with_grace_deadline(deadline)
                .with_notification(NotificationKind::GraceStarted);
        }
        AccessStatus::Suspended => {
            ctx = ctx.with_notification(NotificationKind::Suspended);
        }
        _ => {}
    }

    let outcome = billing.sync.apply_status(user_id, status, ctx).await?;

    Ok(Json(json!({
        "user_id": user_id,
        "status": status.as_str(),
        "applied": outcome == ApplyOutcome::Applied,
    })))
}

async fn sync_stripe_status(
    state: &AppState,
    auth_user: &AuthUser,
    req: &AdminActionRequest,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state.billing_service()?;

    let user_id = req
        .user_id
        .ok_or_else(|| ApiError::BadRequest("user_id is required".to_string()))?;

    let subscription = billing.subscriptions.fetch_remote(user_id).await?;
    billing
        .subscriptions
        .sync_subscription_fields(user_id, &subscription)
        .await?;

    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.pool)
        .await?;
    let current = row
        .and_then(|(s,)| AccessStatus::parse(&s))
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let payment_status = payment_status_from(subscription.status);
    let desired = match payment_status {
        PaymentStatus::Active => AccessStatus::Premium,
        PaymentStatus::PastDue => AccessStatus::PastDue,
        PaymentStatus::Canceled => AccessStatus::Free,
        PaymentStatus::Incomplete => current,
    };

    let applied = if desired != current && can_transition(current, desired) {
        let ctx = StatusContext::admin(
            auth_user.user_id,
            Some("sync_stripe_status".to_string()),
        )
        .with_payment_status(payment_status)
        .with_subscription(subscription.id.to_string());
        billing.sync.apply_status(user_id, desired, ctx).await? == ApplyOutcome::Applied
    } else {
        false
    };

    Ok(Json(json!({
        "user_id": user_id,
        "stripe_status": subscription.status.to_string(),
        "previous_status": current.as_str(),
        "desired_status": desired.as_str(),
        "applied": applied,
    })))
}

async fn grace_period_report(state: &AppState) -> Result<Json<serde_json::Value>, ApiError> {
    let rows: Vec<GraceReportRow> = sqlx::query_as(
        r#"
        SELECT id, email, grace_period_ends_at, payment_failed_at
        FROM users
        WHERE status = 'grace_period'
        ORDER BY grace_period_ends_at ASC NULLS FIRST
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    let now = OffsetDateTime::now_utc();
    let users: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "user_id": row.id,
                "email": row.email,
                "grace_period_ends_at": row.grace_period_ends_at.map(|d| d.to_string()),
                "payment_failed_at": row.payment_failed_at.map(|d| d.to_string()),
                "expired": row.grace_period_ends_at.map(|d| d <= now).unwrap_or(false),
            })
        })
        .collect();

    Ok(Json(json!({
        "count": users.len(),
        "users": users,
    })))
}

async fn payment_health_check(state: &AppState) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state.billing_service()?;
    let summary = billing.health.run_all_checks().await?;
    Ok(Json(serde_json::to_value(summary).map_err(|e| {
        ApiError::Internal(format!("serialization failed: {e}"))
    })?))
}

async fn retry_failed_webhooks(
    state: &AppState,
    req: &AdminActionRequest,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state.billing_service()?;

    let limit = req.limit.unwrap_or(10).clamp(1, 100);
    let failed = billing.ledger.failed_events(limit).await?;

    let mut replayed = 0usize;
    let mut succeeded = 0usize;
    let mut failed_again = 0usize;
    let mut missing_payload = 0usize;

    for event in failed {
        let Some(payload) = event.payload else {
            missing_payload += 1;
            continue;
        };
        replayed += 1;
        match billing.webhooks.replay_event(&payload).await {
            Ok(_) => succeeded += 1,
            Err(e) => {
                failed_again += 1;
                tracing::error!(
                    event_id = %event.stripe_event_id,
                    error = %e,
                    "Webhook replay failed"
                );
            }
        }
    }

    Ok(Json(json!({
        "replayed": replayed,
        "succeeded": succeeded,
        "failed": failed_again,
        "missing_payload": missing_payload,
    })))
}
