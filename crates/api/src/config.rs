//! API server configuration

/// Configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HS256 secret used to verify the auth provider's session tokens.
    pub supabase_jwt_secret: String,
    /// Comma-separated list of allowed CORS origins.
    pub allowed_origins: String,
    /// Whether to construct the billing service at startup.
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let supabase_jwt_secret = std::env::var("SUPABASE_JWT_SECRET").unwrap_or_default();
        if supabase_jwt_secret.is_empty() {
            tracing::warn!("SUPABASE_JWT_SECRET not set - bearer token verification will fail");
        }

        Ok(Self {
            database_url,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            supabase_jwt_secret,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
            enable_billing: std::env::var("ENABLE_BILLING")
                .map(|v| v != "false")
                .unwrap_or(true),
        })
    }
}
