//! Billing history
//!
//! Thin pass-through over Stripe's invoice list for the billing screen.

use stripe::{CustomerId, Invoice, ListInvoices};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Default page size for the billing history endpoint.
pub const DEFAULT_HISTORY_LIMIT: u64 = 12;

/// One billing history entry
#[derive(Debug, Clone, serde::Serialize)]
pub struct BillingHistoryRecord {
    pub invoice_id: String,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: Option<String>,
    pub created_at: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
}

/// A page of billing history
#[derive(Debug, Clone, serde::Serialize)]
pub struct BillingHistoryPage {
    pub entries: Vec<BillingHistoryRecord>,
    pub has_more: bool,
}

/// Billing history service
#[derive(Clone)]
pub struct BillingHistoryService {
    stripe: StripeClient,
}

impl BillingHistoryService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// List invoices for a customer, newest first. `limit` defaults to 12;
    /// `starting_after` pages through older entries.
    pub async fn list(
        &self,
        customer_id: &str,
        limit: Option<u64>,
        starting_after: Option<&str>,
    ) -> BillingResult<BillingHistoryPage> {
        let parsed: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::CustomerNotFound(customer_id.to_string()))?;

        let mut params = ListInvoices::new();
        params.customer = Some(parsed);
        params.limit = Some(limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
        if let Some(cursor) = starting_after {
            params.starting_after = Some(
                cursor
                    .parse()
                    .map_err(|_| BillingError::Internal(format!("bad cursor: {cursor}")))?,
            );
        }

        let invoices = Invoice::list(self.stripe.inner(), &params).await?;

        let entries = invoices
            .data
            .iter()
            .map(|invoice| BillingHistoryRecord {
                invoice_id: invoice.id.to_string(),
                amount_due_cents: invoice.amount_due.unwrap_or(0),
                amount_paid_cents: invoice.amount_paid.unwrap_or(0),
                currency: invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "usd".to_string()),
                status: invoice.status.map(|s| s.to_string()),
                created_at: invoice
                    .created
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
                hosted_invoice_url: invoice.hosted_invoice_url.clone(),
                invoice_pdf_url: invoice.invoice_pdf.clone(),
            })
            .collect();

        Ok(BillingHistoryPage {
            entries,
            has_more: invoices.has_more,
        })
    }
}
