//! Session token verification

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Claims carried by the auth provider's session tokens
#[derive(Debug, Clone, Deserialize)]
pub struct SessionClaims {
    /// User id.
    pub sub: String,
    pub email: Option<String>,
    #[allow(dead_code)]
    pub exp: usize,
}

/// Verifies HS256 session tokens minted by the auth provider
#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Supabase sets aud to "authenticated"; accept either form.
        validation.set_audience(&["authenticated"]);
        validation.validate_aud = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a bearer token and return its claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn mint(secret: &str, sub: &str, exp_offset: i64) -> String {
        let exp = (time::OffsetDateTime::now_utc().unix_timestamp() + exp_offset) as usize;
        let claims = json!({
            "sub": sub,
            "email": "user@example.com",
            "exp": exp,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let manager = JwtManager::new("test-secret");
        let token = mint("test-secret", "8e7ec06e-7ab9-4a3b-97e4-1e26b2b6ef98", 3600);

        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.sub, "8e7ec06e-7ab9-4a3b-97e4-1e26b2b6ef98");
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let manager = JwtManager::new("test-secret");
        let token = mint("other-secret", "user-1", 3600);
        assert!(manager.verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let manager = JwtManager::new("test-secret");
        let token = mint("test-secret", "user-1", -3600);
        assert!(manager.verify(&token).is_err());
    }
}
