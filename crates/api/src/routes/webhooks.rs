//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

/// POST /webhooks/stripe
///
/// Raw body plus the `Stripe-Signature` header. Responds 200 with
/// `{received: true, status}` for both fresh and duplicate deliveries, 400
/// on a bad signature (no side effects), and 500 when the handler failed
/// (the event is marked failed in the ledger for replay).
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let billing = match state.billing_service() {
        Ok(billing) => billing,
        Err(e) => return e.into_response(),
    };

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let event = match billing.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected webhook with invalid signature");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid webhook signature" })),
            )
                .into_response();
        }
    };

    match billing.webhooks.handle_event(event).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({ "received": true, "status": status.as_str() })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "received": true, "status": "error", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
