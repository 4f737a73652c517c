//! Stripe webhook handling
//!
//! Entry point for every billing event. Verifies the signature, claims the
//! event id in the ledger, routes to a per-type handler, and records the
//! terminal outcome. All status decisions flow through the dunning evaluator
//! and the status synchronizer; this module never writes access fields
//! directly.

use hmac::{Hmac, Mac};
use kora_shared::{can_transition, AccessStatus, PaymentStatus};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Invoice, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::dunning::{self, DunningTier};
use crate::error::{BillingError, BillingResult};
use crate::ledger::EventLedger;
use crate::notify::NotificationKind;
use crate::subscriptions::{payment_status_from, SubscriptionService};
use crate::sync::{ApplyOutcome, StatusContext, StatusSynchronizer};

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the signature timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Terminal outcome of handling one webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Processed,
    Duplicate,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Processed => "processed",
            WebhookStatus::Duplicate => "duplicate",
        }
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    ledger: EventLedger,
    sync: StatusSynchronizer,
    subscriptions: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        pool: PgPool,
        sync: StatusSynchronizer,
        subscriptions: SubscriptionService,
    ) -> Self {
        let ledger = EventLedger::new(pool.clone());
        Self {
            stripe,
            pool,
            ledger,
            sync,
            subscriptions,
        }
    }

    /// Verify and parse a Stripe webhook delivery.
    ///
    /// Tries the SDK's verification first, then falls back to manual HMAC
    /// verification: the SDK rejects events from API versions newer than the
    /// one it was generated against, and a version bump on the Stripe
    /// dashboard must not take billing down.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "SDK webhook parsing failed, trying manual verification"
                );
            }
        }

        // Signature header format: t=timestamp,v1=signature[,v0=...]
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;
        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance window"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification passed"
        );

        Ok(event)
    }

    /// Handle a verified event.
    ///
    /// Claims the event id atomically in the ledger; a duplicate delivery
    /// returns without any side effects. The terminal ledger state is
    /// written by this same invocation: `completed` with a result label, or
    /// `failed` with the error for manual replay.
    pub async fn handle_event(&self, event: Event) -> BillingResult<WebhookStatus> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let payload = serde_json::to_value(&event)
            .map_err(|e| BillingError::Internal(format!("event not serializable: {e}")))?;

        let claim = self
            .ledger
            .begin_processing(&event_id, &event_type, event_timestamp, &payload)
            .await?;

        if claim.already_processed {
            return Ok(WebhookStatus::Duplicate);
        }

        tracing::info!(
            event_type = %event_type,
            event_id = %event_id,
            "Processing Stripe webhook event"
        );

        match self.process_event_internal(&event).await {
            Ok(result) => {
                self.ledger.complete(&event_id, result).await?;
                Ok(WebhookStatus::Processed)
            }
            Err(e) => {
                // Writes committed before the failure stay committed; the
                // failed ledger row is the replay hook.
                if let Err(ledger_err) = self.ledger.fail(&event_id, &e.to_string()).await {
                    tracing::error!(
                        event_id = %event_id,
                        error = %ledger_err,
                        "Failed to record webhook failure in ledger"
                    );
                }
                Err(e)
            }
        }
    }

    /// Re-process an event from its stored payload (admin replay).
    pub async fn replay_event(&self, payload: &serde_json::Value) -> BillingResult<&'static str> {
        let event: Event = serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::Internal(format!("stored payload unparseable: {e}")))?;
        let event_id = event.id.to_string();

        let result = self.process_event_internal(&event).await;
        match &result {
            Ok(label) => self.ledger.complete(&event_id, label).await?,
            Err(e) => self.ledger.fail(&event_id, &e.to_string()).await?,
        }
        result
    }

    /// Route one event to its handler. Returns a short result label stored
    /// in the ledger.
    async fn process_event_internal(&self, event: &Event) -> BillingResult<&'static str> {
        match event.type_ {
            EventType::CustomerSubscriptionCreated => {
                self.handle_subscription_created(event).await
            }
            EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_updated(event).await
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event).await
            }
            EventType::InvoicePaid => self.handle_invoice_paid(event).await,
            EventType::InvoicePaymentFailed => self.handle_invoice_payment_failed(event).await,
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            _ => {
                // Track which events arrive without a handler; new event
                // types show up here first.
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type"
                );
                Ok("unhandled")
            }
        }
    }

    async fn handle_subscription_created(&self, event: &Event) -> BillingResult<&'static str> {
        let event_id = event.id.to_string();
        let event_time = event_timestamp(event);
        let subscription = extract_subscription(event)?;
        let user_id = self.resolve_subscription_user(&subscription).await?;

        self.subscriptions
            .sync_subscription_fields(user_id, &subscription)
            .await?;

        let payment_status = payment_status_from(subscription.status);
        if payment_status != PaymentStatus::Active {
            // Incomplete checkout; activation arrives with a later event.
            tracing::info!(
                user_id = %user_id,
                stripe_status = ?subscription.status,
                "Subscription created in non-active state - mirror only"
            );
            return Ok("mirrored");
        }

        let current = self.current_status(user_id).await?;
        let mut ctx = StatusContext::stripe(&event_id, event_time)
            .with_payment_status(PaymentStatus::Active)
            .with_subscription(subscription.id.to_string());
        if current != AccessStatus::Premium {
            ctx = ctx.with_notification(NotificationKind::Welcome);
        }

        let outcome = self
            .sync
            .apply_status(user_id, AccessStatus::Premium, ctx)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription created"
        );

        Ok(label_for(outcome))
    }

    async fn handle_subscription_updated(&self, event: &Event) -> BillingResult<&'static str> {
        let event_id = event.id.to_string();
        let event_time = event_timestamp(event);
        let subscription = extract_subscription(event)?;
        let user_id = self.resolve_subscription_user(&subscription).await?;

        self.subscriptions
            .sync_subscription_fields(user_id, &subscription)
            .await?;

        let current = self.current_status(user_id).await?;
        let mirrored = payment_status_from(subscription.status);

        let label = match mirrored {
            PaymentStatus::Active => {
                match current {
                    AccessStatus::PastDue | AccessStatus::GracePeriod => {
                        // Payment recovered mid-dunning.
                        let ctx = StatusContext::stripe(&event_id, event_time)
                            .with_payment_status(PaymentStatus::Active)
                            .with_subscription(subscription.id.to_string())
                            .with_notification(NotificationKind::PaymentRecovered);
                        label_for(
                            self.sync
                                .apply_status(user_id, AccessStatus::Premium, ctx)
                                .await?,
                        )
                    }
                    AccessStatus::Free => {
                        let ctx = StatusContext::stripe(&event_id, event_time)
                            .with_payment_status(PaymentStatus::Active)
                            .with_subscription(subscription.id.to_string())
                            .with_notification(NotificationKind::Welcome);
                        label_for(
                            self.sync
                                .apply_status(user_id, AccessStatus::Premium, ctx)
                                .await?,
                        )
                    }
                    _ => "mirrored",
                }
            }
            PaymentStatus::PastDue => {
                if current == AccessStatus::Premium {
                    // Dunning notifications are driven by the invoice
                    // events; this transition is silent.
                    let ctx = StatusContext::stripe(&event_id, event_time)
                        .with_payment_status(PaymentStatus::PastDue)
                        .with_subscription(subscription.id.to_string());
                    label_for(
                        self.sync
                            .apply_status(user_id, AccessStatus::PastDue, ctx)
                            .await?,
                    )
                } else {
                    "mirrored"
                }
            }
            PaymentStatus::Canceled | PaymentStatus::Incomplete => "mirrored",
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            stripe_status = ?subscription.status,
            "Subscription updated"
        );

        Ok(label)
    }

    async fn handle_subscription_deleted(&self, event: &Event) -> BillingResult<&'static str> {
        let event_id = event.id.to_string();
        let event_time = event_timestamp(event);
        let subscription = extract_subscription(event)?;
        let user_id = self.resolve_subscription_user(&subscription).await?;

        let current = self.current_status(user_id).await?;
        let label = if current == AccessStatus::Suspended {
            // Suspension outlives the subscription; only an admin
            // reactivation releases it.
            tracing::info!(
                user_id = %user_id,
                "Subscription deleted for suspended user - mirror cleared, status kept"
            );
            "mirror_cleared"
        } else {
            let ctx = StatusContext::stripe(&event_id, event_time)
                .with_payment_status(PaymentStatus::Canceled)
                .with_subscription(subscription.id.to_string())
                .with_notification(NotificationKind::Cancelled);
            label_for(
                self.sync
                    .apply_status(user_id, AccessStatus::Free, ctx)
                    .await?,
            )
        };

        self.subscriptions.clear_subscription_fields(user_id).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription deleted, user downgraded"
        );

        Ok(label)
    }

    async fn handle_invoice_paid(&self, event: &Event) -> BillingResult<&'static str> {
        let event_id = event.id.to_string();
        let event_time = event_timestamp(event);
        let invoice = extract_invoice(event)?;
        let user_id = self.resolve_invoice_user(&invoice).await?;

        let current = self.current_status(user_id).await?;
        let label = match current {
            AccessStatus::PastDue | AccessStatus::GracePeriod => {
                // Recovery: premium restored, dunning fields cleared.
                let ctx = StatusContext::stripe(&event_id, event_time)
                    .with_payment_status(PaymentStatus::Active)
                    .with_notification(NotificationKind::PaymentRecovered);
                label_for(
                    self.sync
                        .apply_status(user_id, AccessStatus::Premium, ctx)
                        .await?,
                )
            }
            AccessStatus::Premium => {
                // Renewal. Same-state apply keeps the mirror fresh and
                // clears anything a racing failure event left behind.
                let ctx = StatusContext::stripe(&event_id, event_time)
                    .with_payment_status(PaymentStatus::Active);
                label_for(
                    self.sync
                        .apply_status(user_id, AccessStatus::Premium, ctx)
                        .await?,
                )
            }
            AccessStatus::Suspended => {
                tracing::warn!(
                    user_id = %user_id,
                    invoice_id = %invoice.id,
                    "Payment received for suspended user - manual reactivation required"
                );
                "ignored_suspended"
            }
            AccessStatus::Free => "ignored",
        };

        tracing::info!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            amount = ?invoice.amount_paid,
            "Invoice paid"
        );

        Ok(label)
    }

    async fn handle_invoice_payment_failed(&self, event: &Event) -> BillingResult<&'static str> {
        let event_id = event.id.to_string();
        let event_time = event_timestamp(event);
        let invoice = extract_invoice(event)?;
        let user_id = self.resolve_invoice_user(&invoice).await?;

        let (current, first_failure) = self.dunning_state(user_id).await?;
        if matches!(current, AccessStatus::Free | AccessStatus::Suspended) {
            tracing::info!(
                user_id = %user_id,
                status = %current,
                "Payment failure for user without live premium cycle - ignored"
            );
            return Ok("ignored");
        }

        let first_failure = first_failure.unwrap_or(event_time);
        let days = (event_time - first_failure).whole_days();
        let decision = dunning::evaluate(days);

        let mut ctx = StatusContext::stripe(&event_id, event_time)
            .with_payment_status(PaymentStatus::PastDue)
            .with_payment_failed_at(first_failure);
        if let Some(sub_id) = invoice_subscription_id(&invoice) {
            ctx = ctx.with_subscription(sub_id);
        }
        if let Some(tier) = decision.notification {
            ctx = ctx.with_notification(match tier {
                DunningTier::Gentle => NotificationKind::DunningGentle,
                DunningTier::Urgent => NotificationKind::DunningUrgent,
                DunningTier::Final => NotificationKind::DunningFinal,
            });
        }
        if decision.status == AccessStatus::GracePeriod && current != AccessStatus::GracePeriod {
            ctx = ctx.with_grace_deadline(dunning::grace_deadline(event_time));
        }

        // A late first delivery can ask for premium -> grace_period in one
        // hop; route it through past_due so the state machine stays honest.
        if !can_transition(current, decision.status)
            && decision.status == AccessStatus::GracePeriod
            && can_transition(current, AccessStatus::PastDue)
        {
            let bridge = StatusContext::stripe(&event_id, event_time)
                .with_payment_status(PaymentStatus::PastDue)
                .with_payment_failed_at(first_failure);
            self.sync
                .apply_status(user_id, AccessStatus::PastDue, bridge)
                .await?;
        }

        let outcome = self
            .sync
            .apply_status(user_id, decision.status, ctx)
            .await?;

        tracing::warn!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            days_since_first_failure = days,
            new_status = %decision.status,
            notification = ?decision.notification,
            "Invoice payment failed"
        );

        Ok(label_for(outcome))
    }

    async fn handle_checkout_completed(&self, event: &Event) -> BillingResult<&'static str> {
        let event_id = event.id.to_string();
        let event_time = event_timestamp(event);
        let session = match &event.data.object {
            EventObject::CheckoutSession(session) => session.clone(),
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let Some(metadata) = &session.metadata else {
            tracing::warn!(session_id = %session.id, "Checkout session without metadata - ignored");
            return Ok("ignored");
        };
        let Some(user_id) = metadata.get("user_id").and_then(|v| Uuid::parse_str(v).ok()) else {
            tracing::warn!(session_id = %session.id, "Checkout session without user_id - ignored");
            return Ok("ignored");
        };

        // Persist any signup discount the checkout carried.
        if let Some(code) = metadata.get("discount_code") {
            let percent: Option<i32> = metadata
                .get("discount_percent")
                .and_then(|p| p.parse().ok());
            sqlx::query(
                r#"
                UPDATE users
                SET signup_discount_code = $2, signup_discount_percent = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .bind(code)
            .bind(percent)
            .execute(&self.pool)
            .await?;
        }

        let Some(subscription_ref) = &session.subscription else {
            tracing::info!(
                user_id = %user_id,
                session_id = %session.id,
                "Checkout completed without subscription - nothing to activate"
            );
            return Ok("ignored");
        };

        let sub_id = subscription_ref
            .id()
            .parse()
            .map_err(|_| BillingError::SubscriptionNotFound(subscription_ref.id().to_string()))?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        self.subscriptions
            .sync_subscription_fields(user_id, &subscription)
            .await?;

        let current = self.current_status(user_id).await?;
        let mut ctx = StatusContext::stripe(&event_id, event_time)
            .with_payment_status(payment_status_from(subscription.status))
            .with_subscription(subscription.id.to_string())
            .with_audit_event(crate::events::AuditEventType::CheckoutCompleted);
        if current != AccessStatus::Premium {
            ctx = ctx.with_notification(NotificationKind::Welcome);
        }

        let outcome = self
            .sync
            .apply_status(user_id, AccessStatus::Premium, ctx)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Checkout completed, subscription active"
        );

        Ok(label_for(outcome))
    }

    async fn current_status(&self, user_id: Uuid) -> BillingResult<AccessStatus> {
        let (status, _) = self.dunning_state(user_id).await?;
        Ok(status)
    }

    async fn dunning_state(
        &self,
        user_id: Uuid,
    ) -> BillingResult<(AccessStatus, Option<OffsetDateTime>)> {
        let row: Option<(String, Option<OffsetDateTime>)> =
            sqlx::query_as("SELECT status, payment_failed_at FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let (status_text, payment_failed_at) =
            row.ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        let status = AccessStatus::parse(&status_text).unwrap_or(AccessStatus::Free);
        Ok((status, payment_failed_at))
    }

    /// Resolve the user for a subscription event: metadata first, linked
    /// customer second.
    async fn resolve_subscription_user(&self, subscription: &Subscription) -> BillingResult<Uuid> {
        if let Some(user_id) = subscription
            .metadata
            .get("user_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            return Ok(user_id);
        }

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        self.user_by_customer(&customer_id).await
    }

    async fn resolve_invoice_user(&self, invoice: &Invoice) -> BillingResult<Uuid> {
        let customer_id = match &invoice.customer {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(c)) => c.id.to_string(),
            None => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Invoice without customer".to_string(),
                ))
            }
        };
        self.user_by_customer(&customer_id).await
    }

    async fn user_by_customer(&self, customer_id: &str) -> BillingResult<Uuid> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(id,)| id)
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }
}

fn label_for(outcome: ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Applied => "applied",
        ApplyOutcome::SkippedStale => "skipped_stale",
    }
}

fn event_timestamp(event: &Event) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(event.created)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn extract_subscription(event: &Event) -> BillingResult<Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn invoice_subscription_id(invoice: &Invoice) -> Option<String> {
    match &invoice.subscription {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(s)) => Some(s.id.to_string()),
        None => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    fn handler() -> WebhookHandler {
        let config = crate::client::StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test_secret".to_string(),
            premium_monthly_price_id: "price_monthly".to_string(),
            premium_yearly_price_id: "price_yearly".to_string(),
            portal_return_url: "http://localhost:3000/settings/billing".to_string(),
        };
        let stripe = crate::client::StripeClient::new(config);
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/kora_test")
            .unwrap();
        let claims = crate::claims::ClaimsClient::new("http://localhost:9999", "key");
        let email = crate::email::EmailService::new(crate::email::EmailConfig {
            api_key: "re_test".to_string(),
            from_address: "Kora <coach@kora.test>".to_string(),
        });
        let notify = crate::notify::NotificationDispatcher::new(pool.clone(), email);
        let sync = StatusSynchronizer::new(
            pool.clone(),
            claims,
            notify,
            "http://localhost:3000/settings/billing".to_string(),
        );
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());
        WebhookHandler::new(stripe, pool, sync, subscriptions)
    }

    fn event_payload(event_id: &str) -> String {
        serde_json::json!({
            "id": event_id,
            "object": "event",
            "api_version": "2023-10-16",
            "created": OffsetDateTime::now_utc().unix_timestamp(),
            "data": {
                "object": {
                    "id": "cus_123",
                    "object": "customer",
                }
            },
            "livemode": false,
            "pending_webhooks": 1,
            "type": "customer.created"
        })
        .to_string()
    }

    #[tokio::test]
    async fn valid_manual_signature_is_accepted() {
        let handler = handler();
        let payload = event_payload("evt_sig_ok");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let signature = sign("whsec_test_secret", now, &payload);

        let event = handler.verify_event(&payload, &signature).unwrap();
        assert_eq!(event.id.as_str(), "evt_sig_ok");
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let handler = handler();
        let payload = event_payload("evt_sig_bad");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let signature = sign("whsec_other_secret", now, &payload);

        let result = handler.verify_event(&payload, &signature);
        assert!(matches!(
            result,
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let handler = handler();
        let payload = event_payload("evt_sig_old");
        let stale = OffsetDateTime::now_utc().unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 60;
        let signature = sign("whsec_test_secret", stale, &payload);

        let result = handler.verify_event(&payload, &signature);
        assert!(matches!(
            result,
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn mangled_header_is_rejected() {
        let handler = handler();
        let payload = event_payload("evt_sig_mangled");

        let result = handler.verify_event(&payload, "v1=deadbeef");
        assert!(matches!(
            result,
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }
}
