//! Stripe billing portal sessions
//!
//! Payment-method updates happen on Stripe's hosted portal; this service
//! only mints the redirect URL.

use stripe::{BillingPortalSession, CreateBillingPortalSession, CustomerId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Response from creating a portal session
#[derive(Debug, Clone, serde::Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}

/// Billing portal service
#[derive(Clone)]
pub struct PortalService {
    stripe: StripeClient,
}

impl PortalService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Create a portal session for updating the payment method.
    pub async fn create_update_session(&self, customer_id: &str) -> BillingResult<PortalResponse> {
        let parsed: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::CustomerNotFound(customer_id.to_string()))?;

        let mut params = CreateBillingPortalSession::new(parsed);
        params.return_url = Some(&self.stripe.config().portal_return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        Ok(PortalResponse {
            portal_url: session.url,
        })
    }
}
