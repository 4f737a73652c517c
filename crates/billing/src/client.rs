//! Stripe client wrapper
//!
//! Constructed once at startup and injected into every component that talks
//! to Stripe. Nothing in this crate builds a Stripe client lazily inside a
//! request handler.

use std::sync::Arc;

use kora_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub premium_monthly_price_id: String,
    pub premium_yearly_price_id: String,
    /// Where the billing portal sends the user back to.
    pub portal_return_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = require_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;
        let premium_monthly_price_id =
            std::env::var("STRIPE_PRICE_PREMIUM_MONTHLY").unwrap_or_default();
        let premium_yearly_price_id =
            std::env::var("STRIPE_PRICE_PREMIUM_YEARLY").unwrap_or_default();
        let portal_return_url = std::env::var("APP_BASE_URL")
            .map(|base| format!("{}/settings/billing", base.trim_end_matches('/')))
            .unwrap_or_else(|_| "http://localhost:3000/settings/billing".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            premium_monthly_price_id,
            premium_yearly_price_id,
            portal_return_url,
        })
    }

    /// Map a Stripe price id back to the plan tier it sells.
    pub fn tier_for_price(&self, price_id: &str) -> SubscriptionTier {
        if price_id == self.premium_monthly_price_id || price_id == self.premium_yearly_price_id {
            SubscriptionTier::Premium
        } else {
            SubscriptionTier::Free
        }
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{name} must be set")))
}

/// Shared Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying SDK client, for direct API calls.
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
