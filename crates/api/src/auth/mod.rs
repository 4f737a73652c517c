//! Authentication

mod jwt;
mod middleware;

pub use jwt::JwtManager;
pub use middleware::{require_admin, require_auth, AuthState, AuthUser};
