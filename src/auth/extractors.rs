use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::warn;

use super::{
    cookies::{read_cookie, SESSION_COOKIE},
    session::{Claims, SessionKeys},
};
use crate::{error::AuthError, state::AppState};

/// Verified session claims. Rejects with 401 before the handler runs.
pub struct AuthUser(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Cookie first, then "Bearer <token>" for non-browser clients
        let token = read_cookie(&parts.headers, SESSION_COOKIE)
            .or_else(|| {
                let auth = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
                auth.strip_prefix("Bearer ")
                    .or_else(|| auth.strip_prefix("bearer "))
                    .map(str::to_string)
            })
            .ok_or(AuthError::NotAuthenticated)?;

        let claims = SessionKeys::from_ref(state).verify(&token).map_err(|e| {
            warn!(error = %e, "session rejected");
            AuthError::from(e)
        })?;
        Ok(AuthUser(claims))
    }
}
