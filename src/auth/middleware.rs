// Authentication extractor for protected routes

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use tracing::{debug, warn};

use crate::auth::error::AuthError;
use crate::policy::CustomerTier;
use crate::AppState;

/// Customer identified by the bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i32,
    pub email: String,
    pub tier: CustomerTier,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::MissingToken)?
            .to_str()
            .map_err(|_| AuthError::InvalidToken)?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            warn!("Authorization header missing 'Bearer ' prefix for {}", parts.uri.path());
            AuthError::InvalidToken
        })?;

        let state = AppState::from_ref(state);
        let claims = state.tokens.validate_access_token(token)?;
        debug!("Authenticated user_id={} tier={:?}", claims.sub, claims.tier);

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            email: claims.email,
            tier: claims.tier,
        })
    }
}
