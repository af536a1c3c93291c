//! Signed, stateless session tokens carried in an HTTP-only cookie.

use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use super::cookies::{build_cookie, removal_cookie, SESSION_COOKIE};
use crate::{
    config::{SessionConfig, MAX_SESSION_TTL_MINUTES},
    state::AppState,
    store::Role,
    store::User,
};

/// Session token payload.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,   // user ID
    pub role: Role,  // role at issue time
    pub iat: usize,  // issued at
    pub exp: usize,  // expires at
    pub iss: String, // issuer
    pub aud: String, // audience
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid session token")]
    InvalidSignature,

    #[error("Session expired")]
    Expired,
}

/// Signing keys plus the cookie policy derived from [`SessionConfig`].
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
    secure_cookie: bool,
}

/// A freshly minted token plus the cookie policy it is delivered under.
#[derive(Debug)]
pub struct IssuedSession {
    pub token: String,
    max_age: i64,
    secure: bool,
}

impl IssuedSession {
    /// `Set-Cookie` value carrying the token.
    pub fn cookie(&self) -> String {
        build_cookie(SESSION_COOKIE, &self.token, self.max_age, self.secure)
    }
}

impl FromRef<AppState> for SessionKeys {
    fn from_ref(state: &AppState) -> Self {
        SessionKeys::new(&state.config.session)
    }
}

impl SessionKeys {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            ttl: Duration::from_secs(cfg.ttl_minutes.clamp(1, MAX_SESSION_TTL_MINUTES) as u64 * 60),
            secure_cookie: cfg.secure_cookie,
        }
    }

    pub fn issue(&self, user: &User) -> anyhow::Result<IssuedSession> {
        self.issue_at(user.id, user.role, OffsetDateTime::now_utc())
    }

    pub(crate) fn issue_at(
        &self,
        user_id: Uuid,
        role: Role,
        now: OffsetDateTime,
    ) -> anyhow::Result<IssuedSession> {
        let exp = now + TimeDuration::seconds(self.ttl.as_secs() as i64);
        let claims = Claims {
            sub: user_id,
            role,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user_id, role = %role, "session signed");
        Ok(IssuedSession {
            token,
            max_age: self.ttl.as_secs() as i64,
            secure: self.secure_cookie,
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, SessionError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => SessionError::Expired,
                _ => SessionError::InvalidSignature,
            }
        })?;
        debug!(user_id = %data.claims.sub, "session verified");
        Ok(data.claims)
    }

    /// Clears the cookie on this client only; other copies of the token stay valid.
    pub fn revoke(&self) -> String {
        removal_cookie(SESSION_COOKIE, self.secure_cookie)
    }
}
