//! Billing error types

use kora_shared::AccessStatus;

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors from billing operations
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Unsupported webhook event payload: {0}")]
    WebhookEventNotSupported(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("No Stripe customer linked for user {0}")]
    CustomerNotFound(String),

    #[error("No subscription linked for user {0}")]
    SubscriptionNotFound(String),

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: AccessStatus,
        to: AccessStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
