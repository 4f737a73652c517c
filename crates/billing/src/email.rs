//! Email delivery via the Resend HTTP API
//!
//! Transport only; templates live in `notify`. Runs in disabled mode when no
//! API key is configured so local development never blocks on email.

use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE: &str = "https://api.resend.com";

/// Email configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_address: String,
}

/// HTTP email sender
#[derive(Clone)]
pub struct EmailService {
    http: reqwest::Client,
    config: Option<Arc<EmailConfig>>,
    api_base: String,
}

impl EmailService {
    /// Build from `RESEND_API_KEY` / `EMAIL_FROM`. Missing key means
    /// disabled mode: sends are logged and reported as delivered.
    pub fn from_env() -> Self {
        let config = std::env::var("RESEND_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(|api_key| {
                Arc::new(EmailConfig {
                    api_key,
                    from_address: std::env::var("EMAIL_FROM")
                        .unwrap_or_else(|_| "Kora <coach@kora.app>".to_string()),
                })
            });

        Self {
            http: reqwest::Client::new(),
            config,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn new(config: EmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Some(Arc::new(config)),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point the client at a different API host (integration tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Send one email. Transient HTTP failures are retried twice with
    /// jittered exponential backoff before surfacing an error.
    pub async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(config) = &self.config else {
            tracing::info!(to = %to, subject = %subject, "Email disabled - skipping send");
            return Ok(());
        };

        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(2);

        let url = format!("{}/emails", self.api_base);
        let body = serde_json::json!({
            "from": config.from_address,
            "to": [to],
            "subject": subject,
            "html": html,
        });

        Retry::spawn(strategy, || async {
            self.http
                .post(&url)
                .bearer_auth(&config.api_key)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, reqwest::Error>(())
        })
        .await
        .map_err(BillingError::Http)?;

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn service(api_base: String) -> EmailService {
        EmailService::new(EmailConfig {
            api_key: "re_test_key".to_string(),
            from_address: "Kora <coach@kora.test>".to_string(),
        })
        .with_api_base(api_base)
    }

    #[tokio::test]
    async fn send_posts_to_email_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test_key")
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let svc = service(server.url());
        svc.send("user@example.com", "Hello", "<p>Hi</p>")
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_surfaces_persistent_failure() {
        let mut server = mockito::Server::new_async().await;
        // Initial attempt plus two retries.
        let mock = server
            .mock("POST", "/emails")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let svc = service(server.url());
        let result = svc.send("user@example.com", "Hello", "<p>Hi</p>").await;

        assert!(result.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn disabled_service_reports_success() {
        let svc = EmailService {
            http: reqwest::Client::new(),
            config: None,
            api_base: DEFAULT_API_BASE.to_string(),
        };
        assert!(!svc.is_enabled());
        svc.send("user@example.com", "Hello", "<p>Hi</p>")
            .await
            .unwrap();
    }
}
