//! Chat usage guard endpoint

use axum::{
    extract::{Extension, State},
    Json,
};
use kora_billing::UsageDecision;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// POST /usage/chat
///
/// Counts one chat message against the caller's daily quota and returns
/// whether it is allowed. The chat backend calls this before forwarding the
/// message to the model.
pub async fn record_chat_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<UsageDecision>, ApiError> {
    let billing = state.billing_service()?;
    let decision = billing.usage.check_and_increment(auth_user.user_id).await?;

    if !decision.allowed {
        tracing::info!(
            user_id = %auth_user.user_id,
            reason = ?decision.reason,
            "Chat message rejected by usage guard"
        );
    }

    Ok(Json(decision))
}
