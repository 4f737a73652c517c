//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;

use super::jwt::JwtManager;

/// Authenticated user extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub is_admin: bool,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

/// Extract the bearer token from the Authorization header.
fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(String::from)
}

async fn authenticate(auth_state: &AuthState, token: &str) -> Result<AuthUser, ApiError> {
    let claims = auth_state.jwt_manager.verify(token).map_err(|e| {
        tracing::warn!(error = %e, "Bearer token verification failed");
        ApiError::Unauthorized
    })?;

    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| {
        tracing::warn!(sub = %claims.sub, "Token subject is not a user id");
        ApiError::Unauthorized
    })?;

    let row: Option<(Option<String>, bool)> =
        sqlx::query_as("SELECT email, is_admin FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&auth_state.pool)
            .await
            .map_err(|e| ApiError::Database(e.to_string()))?;

    // A valid token for a user we have never seen is still unauthorized;
    // signup provisions the row before the first API call.
    let (email, is_admin) = row.ok_or(ApiError::Unauthorized)?;

    Ok(AuthUser {
        user_id,
        email: email.or(claims.email),
        is_admin,
    })
}

/// Middleware that requires a valid bearer token.
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let token = extract_bearer_token(&request).ok_or(ApiError::Unauthorized);

    let auth_result = match token {
        Ok(token) => authenticate(&auth_state, &token).await,
        Err(err) => Err(err),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                is_admin = auth_user.is_admin,
                "Authenticated"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "Authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that additionally requires the `is_admin` flag.
///
/// Layered after `require_auth`, so the extension is always present.
pub async fn require_admin(request: Request, next: Next) -> Response {
    let is_admin = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.is_admin)
        .unwrap_or(false);

    if !is_admin {
        return ApiError::Forbidden.into_response();
    }
    next.run(request).await
}
