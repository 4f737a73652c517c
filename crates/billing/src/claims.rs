//! Auth-claims store client
//!
//! Writes the user's access status into the auth provider's app metadata so
//! clients can authorize from their session token without a database round
//! trip. Deliveries are driven through the claims outbox, never awaited
//! inline with the billing write.

use kora_shared::AccessStatus;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Client for the auth provider's admin API
#[derive(Clone)]
pub struct ClaimsClient {
    http: reqwest::Client,
    base_url: Option<String>,
    service_role_key: String,
}

impl ClaimsClient {
    /// Build from `SUPABASE_URL` / `SUPABASE_SERVICE_ROLE_KEY`. Missing
    /// configuration means disabled mode: updates are logged and reported as
    /// delivered, so local development works without an auth project.
    pub fn from_env() -> Self {
        let base_url = std::env::var("SUPABASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('/').to_string());
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY").unwrap_or_default();

        if base_url.is_some() && service_role_key.is_empty() {
            tracing::warn!(
                "SUPABASE_URL configured but SUPABASE_SERVICE_ROLE_KEY missing - claims updates will fail"
            );
        }

        Self {
            http: reqwest::Client::new(),
            base_url,
            service_role_key,
        }
    }

    pub fn new(base_url: impl Into<String>, service_role_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: Some(base_url.into().trim_end_matches('/').to_string()),
            service_role_key: service_role_key.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }

    /// Write the access status into the user's app metadata.
    pub async fn update_status(&self, user_id: Uuid, status: AccessStatus) -> BillingResult<()> {
        let Some(base_url) = &self.base_url else {
            tracing::info!(user_id = %user_id, status = %status, "Claims store disabled - skipping update");
            return Ok(());
        };

        let url = format!("{}/auth/v1/admin/users/{}", base_url, user_id);
        let body = serde_json::json!({
            "app_metadata": { "kora_status": status.as_str() }
        });

        let response = self
            .http
            .put(&url)
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status_code = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(
                user_id = %user_id,
                http_status = %status_code,
                response = %text,
                "Claims store update rejected"
            );
            return Err(BillingError::Internal(format!(
                "claims store returned {status_code}"
            )));
        }

        tracing::info!(user_id = %user_id, status = %status, "Claims store updated");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_puts_app_metadata() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();

        let mock = server
            .mock("PUT", format!("/auth/v1/admin/users/{}", user_id).as_str())
            .match_header("apikey", "service_key")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"app_metadata":{"kora_status":"grace_period"}}"#.to_string(),
            ))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = ClaimsClient::new(server.url(), "service_key");
        client
            .update_status(user_id, AccessStatus::GracePeriod)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejection_surfaces_as_error() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();

        server
            .mock("PUT", format!("/auth/v1/admin/users/{}", user_id).as_str())
            .with_status(403)
            .with_body(r#"{"error":"forbidden"}"#)
            .create_async()
            .await;

        let client = ClaimsClient::new(server.url(), "bad_key");
        let result = client.update_status(user_id, AccessStatus::Premium).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disabled_client_reports_success() {
        let client = ClaimsClient {
            http: reqwest::Client::new(),
            base_url: None,
            service_role_key: String::new(),
        };
        assert!(!client.is_enabled());
        client
            .update_status(Uuid::new_v4(), AccessStatus::Suspended)
            .await
            .unwrap();
    }
}
