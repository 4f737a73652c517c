// Billing crate clippy configuration
#![allow(clippy::field_reassign_with_default)] // Stripe param structs are built field-by-field
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kora Billing Module
//!
//! The billing and access-control core behind the chat coach: Stripe
//! webhooks, the payment dunning state machine, and status synchronization
//! across the document store, the auth-claims store, and the notification
//! queue.
//!
//! ## Features
//!
//! - **Webhooks**: signed Stripe event handling with an idempotent event ledger
//! - **Dunning**: time-based escalation from silent retry to suspension
//! - **Status Sync**: transactional outbox keeps claims and audit consistent
//! - **Notifications**: queued email with bounded retries
//! - **Usage Metering**: per-day chat quotas with abuse detection
//! - **Subscriptions**: pause, cancel at period end, billing portal, history
//! - **Health Checks**: runnable consistency checks over all stores

pub mod claims;
pub mod client;
pub mod dunning;
pub mod email;
pub mod error;
pub mod events;
pub mod health;
pub mod history;
pub mod ledger;
pub mod notify;
pub mod portal;
pub mod subscriptions;
pub mod sweeper;
pub mod sync;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Claims
pub use claims::ClaimsClient;

// Client
pub use client::{StripeClient, StripeConfig};

// Dunning
pub use dunning::{evaluate, grace_deadline, DunningDecision, DunningTier, GRACE_PERIOD_DAYS};

// Email
pub use email::{EmailConfig, EmailService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, AuditEvent, AuditEventBuilder, AuditEventType, AuditLogger};

// Health
pub use health::{HealthChecker, HealthSummary, HealthViolation, Severity};

// History
pub use history::{BillingHistoryPage, BillingHistoryRecord, BillingHistoryService};

// Ledger
pub use ledger::{BeginOutcome, EventLedger, FailedEvent};

// Notify
pub use notify::{
    render, NotificationDispatcher, NotificationKind, NotifySummary, RenderedEmail, TemplateData,
};

// Portal
pub use portal::{PortalResponse, PortalService};

// Subscriptions
pub use subscriptions::{
    BillingInfo, CancelResult, PauseResult, SubscriptionService, PAUSE_DAYS,
};

// Sweeper
pub use sweeper::{GracePeriodSweeper, SweepSummary};

// Sync
pub use sync::{ApplyOutcome, OutboxSummary, StatusContext, StatusSynchronizer};

// Usage
pub use usage::{DenyReason, UsageCounter, UsageDecision};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookStatus};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub audit: AuditLogger,
    pub claims: ClaimsClient,
    pub email: EmailService,
    pub health: HealthChecker,
    pub history: BillingHistoryService,
    pub ledger: EventLedger,
    pub notify: NotificationDispatcher,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub sweeper: GracePeriodSweeper,
    pub sync: StatusSynchronizer,
    pub usage: UsageCounter,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::build(stripe, pool))
    }

    /// Create a billing service with explicit Stripe config.
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::build(StripeClient::new(config), pool)
    }

    fn build(stripe: StripeClient, pool: PgPool) -> Self {
        let email = EmailService::from_env();
        let claims = ClaimsClient::from_env();
        let billing_url = stripe.config().portal_return_url.clone();

        let notify = NotificationDispatcher::new(pool.clone(), email.clone());
        let sync = StatusSynchronizer::new(
            pool.clone(),
            claims.clone(),
            notify.clone(),
            billing_url,
        );
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());

        Self {
            audit: AuditLogger::new(pool.clone()),
            claims,
            email,
            health: HealthChecker::new(pool.clone()),
            history: BillingHistoryService::new(stripe.clone()),
            ledger: EventLedger::new(pool.clone()),
            notify: notify.clone(),
            portal: PortalService::new(stripe.clone()),
            subscriptions: subscriptions.clone(),
            sweeper: GracePeriodSweeper::new(pool.clone(), sync.clone()),
            sync: sync.clone(),
            usage: UsageCounter::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, sync, subscriptions),
        }
    }
}
