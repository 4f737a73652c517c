//! Route definitions

pub mod admin;
pub mod billing;
pub mod usage;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::auth::{require_admin, require_auth};
use crate::state::AppState;

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Authenticated user surface.
    let user_routes = Router::new()
        .route("/billing/info", get(billing::get_billing_info))
        .route("/billing/history", get(billing::get_billing_history))
        .route("/billing/pause", post(billing::pause_subscription))
        .route("/billing/cancel", post(billing::cancel_subscription))
        .route("/billing/portal", post(billing::create_portal_session))
        .route("/usage/chat", post(usage::record_chat_message))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    // Admin surface: authenticated, then gated on the is_admin flag.
    let admin_routes = Router::new()
        .route("/admin", post(admin::dispatch_action))
        .layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .route("/health", get(health))
        // Webhooks authenticate with the signature, not a bearer token.
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(user_routes)
        .merge(admin_routes)
        .with_state(state)
}
