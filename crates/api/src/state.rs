//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::{AuthState, JwtManager};
use crate::config::Config;

/// Shared application state
///
/// External clients (Stripe, email, claims) are constructed once here and
/// injected; handlers never build clients lazily.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Billing service; None when Stripe is not configured.
    pub billing: Option<Arc<kora_billing::BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.supabase_jwt_secret);

        let billing = if config.enable_billing {
            match kora_billing::BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }

    /// Auth state for middleware.
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
        }
    }

    /// Billing service, or the 503 error every billing endpoint returns
    /// when Stripe is not configured.
    pub fn billing_service(
        &self,
    ) -> Result<&Arc<kora_billing::BillingService>, crate::error::ApiError> {
        self.billing
            .as_ref()
            .ok_or(crate::error::ApiError::ServiceUnavailable)
    }
}
