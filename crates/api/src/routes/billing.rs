//! Billing management endpoints
//!
//! All require a bearer token resolving to a known user; operations on a
//! subscription additionally require a linked Stripe customer (404 without
//! one).

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use kora_billing::{BillingHistoryPage, BillingInfo, CancelResult, PauseResult, PortalResponse};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Request to cancel a subscription
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Optional reason, stored on the Stripe subscription and audited.
    pub reason: Option<String>,
}

/// Query parameters for billing history
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u64>,
    pub starting_after: Option<String>,
}

async fn customer_id_for(state: &AppState, user_id: Uuid) -> Result<String, ApiError> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT stripe_customer_id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&state.pool)
            .await?;

    row.ok_or_else(|| ApiError::NotFound("User not found".to_string()))?
        .0
        .ok_or_else(|| ApiError::NotFound("No linked billing account".to_string()))
}

/// GET /billing/info
pub async fn get_billing_info(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<BillingInfo>, ApiError> {
    let billing = state.billing_service()?;
    let info = billing
        .subscriptions
        .get_billing_info(auth_user.user_id)
        .await?;
    Ok(Json(info))
}

/// GET /billing/history?limit=&starting_after=
pub async fn get_billing_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<BillingHistoryPage>, ApiError> {
    let billing = state.billing_service()?;
    let customer_id = customer_id_for(&state, auth_user.user_id).await?;

    let page = billing
        .history
        .list(
            &customer_id,
            query.limit,
            query.starting_after.as_deref(),
        )
        .await?;
    Ok(Json(page))
}

/// POST /billing/pause
pub async fn pause_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PauseResult>, ApiError> {
    let billing = state.billing_service()?;
    let result = billing
        .subscriptions
        .pause_subscription(auth_user.user_id)
        .await?;
    Ok(Json(result))
}

/// POST /billing/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResult>, ApiError> {
    let billing = state.billing_service()?;
    let result = billing
        .subscriptions
        .cancel_subscription(auth_user.user_id, req.reason.as_deref())
        .await?;
    Ok(Json(result))
}

/// POST /billing/portal
///
/// Returns the Stripe-hosted URL where the user updates their payment
/// method.
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PortalResponse>, ApiError> {
    let billing = state.billing_service()?;
    let customer_id = customer_id_for(&state, auth_user.user_id).await?;

    let response = billing.portal.create_update_session(&customer_id).await?;
    Ok(Json(response))
}
