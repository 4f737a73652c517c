//! Subscription management
//!
//! Mirrors Stripe subscription state onto the user record and drives the
//! user-facing subscription operations: pause (fixed 30 days), cancel at
//! period end, and the billing-info view. Status changes themselves go
//! through the status synchronizer; this module only touches subscription
//! mirror fields.

use kora_shared::PaymentStatus;
use sqlx::PgPool;
use stripe::{
    Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus, UpdateSubscription,
    UpdateSubscriptionPauseCollection, UpdateSubscriptionPauseCollectionBehavior,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};

/// Fixed length of a voluntary subscription pause.
pub const PAUSE_DAYS: i64 = 30;

/// Billing state of a user, as shown in the app.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BillingInfo {
    pub status: String,
    pub payment_status: String,
    pub approval_type: String,
    pub tier: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub payment_failed_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub current_period_end: Option<OffsetDateTime>,
    pub pause_resumes_at: Option<OffsetDateTime>,
}

/// Result of pausing a subscription.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PauseResult {
    pub resumes_at: OffsetDateTime,
}

/// Result of scheduling a cancellation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancelResult {
    /// End of the current billing period; access continues until then.
    pub effective_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct BillingRow {
    status: String,
    payment_status: String,
    approval_type: String,
    subscription_tier: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_price_id: Option<String>,
    grace_period_ends_at: Option<OffsetDateTime>,
    payment_failed_at: Option<OffsetDateTime>,
}

/// Map a Stripe subscription status onto the mirrored payment status.
pub fn payment_status_from(status: StripeSubStatus) -> PaymentStatus {
    match status {
        StripeSubStatus::Active | StripeSubStatus::Trialing => PaymentStatus::Active,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid => PaymentStatus::PastDue,
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => PaymentStatus::Canceled,
        StripeSubStatus::Incomplete | StripeSubStatus::Paused => PaymentStatus::Incomplete,
    }
}

fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

/// Subscription operations
#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    audit: AuditLogger,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            audit,
        }
    }

    async fn billing_row(&self, user_id: Uuid) -> BillingResult<BillingRow> {
        let row: Option<BillingRow> = sqlx::query_as(
            r#"
            SELECT status, payment_status, approval_type, subscription_tier,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   grace_period_ends_at, payment_failed_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }

    fn parse_subscription_id(&self, raw: &str) -> BillingResult<SubscriptionId> {
        raw.parse()
            .map_err(|_| BillingError::SubscriptionNotFound(raw.to_string()))
    }

    /// Billing info for the app. Stripe enriches the view when reachable;
    /// a Stripe outage degrades to the stored record instead of failing.
    pub async fn get_billing_info(&self, user_id: Uuid) -> BillingResult<BillingInfo> {
        let row = self.billing_row(user_id).await?;

        let mut info = BillingInfo {
            status: row.status,
            payment_status: row.payment_status,
            approval_type: row.approval_type,
            tier: row.subscription_tier,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id.clone(),
            stripe_price_id: row.stripe_price_id,
            grace_period_ends_at: row.grace_period_ends_at,
            payment_failed_at: row.payment_failed_at,
            cancel_at_period_end: None,
            current_period_end: None,
            pause_resumes_at: None,
        };

        if let Some(sub_id) = &row.stripe_subscription_id {
            match self.retrieve(sub_id).await {
                Ok(subscription) => {
                    info.cancel_at_period_end = Some(subscription.cancel_at_period_end);
                    info.current_period_end = from_unix(subscription.current_period_end);
                    info.pause_resumes_at = subscription
                        .pause_collection
                        .as_ref()
                        .and_then(|p| p.resumes_at)
                        .and_then(from_unix);
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Stripe unavailable for billing info - serving stored record only"
                    );
                }
            }
        }

        Ok(info)
    }

    async fn retrieve(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let id = self.parse_subscription_id(subscription_id)?;
        Ok(Subscription::retrieve(self.stripe.inner(), &id, &[]).await?)
    }

    /// Pause collection for a fixed 30 days.
    pub async fn pause_subscription(&self, user_id: Uuid) -> BillingResult<PauseResult> {
        let row = self.billing_row(user_id).await?;
        let sub_id = row
            .stripe_subscription_id
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;
        let parsed = self.parse_subscription_id(&sub_id)?;

        let resumes_at = OffsetDateTime::now_utc() + Duration::days(PAUSE_DAYS);

        let mut params = UpdateSubscription::new();
        params.pause_collection = Some(UpdateSubscriptionPauseCollection {
            behavior: UpdateSubscriptionPauseCollectionBehavior::Void,
            resumes_at: Some(resumes_at.unix_timestamp()),
        });
        Subscription::update(self.stripe.inner(), &parsed, params).await?;

        if let Err(e) = self
            .audit
            .log_event(
                AuditEventBuilder::new(user_id, AuditEventType::SubscriptionPaused)
                    .data(serde_json::json!({
                        "resumes_at": resumes_at.to_string(),
                        "pause_days": PAUSE_DAYS,
                    }))
                    .stripe_subscription(&sub_id)
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription pause");
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub_id,
            resumes_at = %resumes_at,
            "Subscription paused"
        );

        Ok(PauseResult { resumes_at })
    }

    /// Schedule a cancellation at the end of the current period. The status
    /// change to free happens when the deletion webhook arrives.
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        reason: Option<&str>,
    ) -> BillingResult<CancelResult> {
        let row = self.billing_row(user_id).await?;
        let sub_id = row
            .stripe_subscription_id
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;
        let parsed = self.parse_subscription_id(&sub_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);
        if let Some(reason) = reason {
            let mut metadata = std::collections::HashMap::new();
            metadata.insert("cancellation_reason".to_string(), reason.to_string());
            params.metadata = Some(metadata);
        }
        let updated = Subscription::update(self.stripe.inner(), &parsed, params).await?;

        let effective_at = from_unix(updated.current_period_end);

        if let Err(e) = self
            .audit
            .log_event(
                AuditEventBuilder::new(user_id, AuditEventType::CancellationScheduled)
                    .data(serde_json::json!({
                        "reason": reason,
                        "effective_at": effective_at.map(|d| d.to_string()),
                    }))
                    .stripe_subscription(&sub_id)
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log cancellation");
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub_id,
            effective_at = ?effective_at,
            reason = ?reason,
            "Cancellation scheduled at period end"
        );

        Ok(CancelResult { effective_at })
    }

    /// Mirror a Stripe subscription object's identifiers and payment status
    /// onto the user record. Does not touch the access status.
    pub async fn sync_subscription_fields(
        &self,
        user_id: Uuid,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());
        let tier = price_id
            .as_deref()
            .map(|p| self.stripe.config().tier_for_price(p))
            .unwrap_or_default();
        let payment_status = payment_status_from(subscription.status);

        sqlx::query(
            r#"
            UPDATE users
            SET stripe_subscription_id = $2,
                stripe_price_id = $3,
                subscription_tier = $4,
                payment_status = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(subscription.id.as_str())
        .bind(&price_id)
        .bind(tier.as_str())
        .bind(payment_status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Clear the subscription mirror after a deletion event.
    pub async fn clear_subscription_fields(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET stripe_subscription_id = NULL,
                stripe_price_id = NULL,
                subscription_tier = 'free',
                payment_status = 'canceled',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch the live subscription for an admin-triggered resync.
    pub async fn fetch_remote(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let row = self.billing_row(user_id).await?;
        let sub_id = row
            .stripe_subscription_id
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;
        self.retrieve(&sub_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_statuses_map_onto_payment_mirror() {
        assert_eq!(
            payment_status_from(StripeSubStatus::Active),
            PaymentStatus::Active
        );
        assert_eq!(
            payment_status_from(StripeSubStatus::Trialing),
            PaymentStatus::Active
        );
        assert_eq!(
            payment_status_from(StripeSubStatus::PastDue),
            PaymentStatus::PastDue
        );
        assert_eq!(
            payment_status_from(StripeSubStatus::Unpaid),
            PaymentStatus::PastDue
        );
        assert_eq!(
            payment_status_from(StripeSubStatus::Canceled),
            PaymentStatus::Canceled
        );
        assert_eq!(
            payment_status_from(StripeSubStatus::Incomplete),
            PaymentStatus::Incomplete
        );
    }
}
