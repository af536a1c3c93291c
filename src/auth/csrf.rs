use std::sync::Arc;

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use tracing::warn;

use super::cookies::{build_cookie, removal_cookie, CSRF_COOKIE};
use crate::store::{CredentialStore, StoreResult};

pub const CSRF_TTL_SECS: i64 = 10 * 60;
const STATE_LEN: usize = 32;

/// Anti-forgery state for one authorization round trip. The value rides in a
/// short-lived cookie and is also recorded server-side, where the first
/// validation attempt deletes it.
#[derive(Clone)]
pub struct CsrfStateGuard {
    store: Arc<dyn CredentialStore>,
    secure_cookie: bool,
}

#[derive(Debug)]
pub struct IssuedState {
    pub value: String,
    pub cookie: String,
}

/// `Set-Cookie` value deleting the state cookie; sent after every callback.
pub fn clear_state_cookie(secure: bool) -> String {
    removal_cookie(CSRF_COOKIE, secure)
}

impl CsrfStateGuard {
    pub fn new(store: Arc<dyn CredentialStore>, secure_cookie: bool) -> Self {
        Self {
            store,
            secure_cookie,
        }
    }

    pub async fn issue(&self) -> StoreResult<IssuedState> {
        let value: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(STATE_LEN)
            .map(char::from)
            .collect();
        let expires_at = OffsetDateTime::now_utc() + Duration::seconds(CSRF_TTL_SECS);
        self.store.put_oauth_state(&value, expires_at).await?;
        let cookie = build_cookie(CSRF_COOKIE, &value, CSRF_TTL_SECS, self.secure_cookie);
        Ok(IssuedState { value, cookie })
    }

    /// Consumes the server-side record of the cookie's state whatever the
    /// outcome. Passes only for a matching, unexpired, not yet used state.
    pub async fn validate(&self, stored: Option<String>, received: &str) -> StoreResult<bool> {
        let Some(expected) = stored else {
            warn!("oauth state cookie missing");
            return Ok(false);
        };
        let record = self.store.take_oauth_state(&expected).await?;

        if received.is_empty() || !bool::from(expected.as_bytes().ct_eq(received.as_bytes())) {
            warn!("oauth state mismatch");
            return Ok(false);
        }
        match record {
            None => {
                warn!("oauth state unknown or already used");
                Ok(false)
            }
            Some(expires_at) if expires_at <= OffsetDateTime::now_utc() => {
                warn!("oauth state expired");
                Ok(false)
            }
            Some(_) => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryCredentialStore;

    fn guard() -> (Arc<InMemoryCredentialStore>, CsrfStateGuard) {
        let store = Arc::new(InMemoryCredentialStore::new());
        (store.clone(), CsrfStateGuard::new(store, false))
    }

    #[tokio::test]
    async fn issued_states_are_random_and_cookie_bound() {
        let (_, guard) = guard();
        let a = guard.issue().await.unwrap();
        let b = guard.issue().await.unwrap();
        assert_eq!(a.value.len(), STATE_LEN);
        assert_ne!(a.value, b.value);
        assert!(a.cookie.starts_with(&format!("github-oauth-state={};", a.value)));
        assert!(a.cookie.contains("Max-Age=600"));
        assert!(a.cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn state_is_single_use_across_requests() {
        let (_, guard) = guard();
        let issued = guard.issue().await.unwrap();
        // each request brings its own copy of the cookie
        assert!(guard.validate(Some(issued.value.clone()), &issued.value).await.unwrap());
        assert!(!guard.validate(Some(issued.value.clone()), &issued.value).await.unwrap());
    }

    #[tokio::test]
    async fn mismatch_fails_closed_and_burns_the_state() {
        let (_, guard) = guard();
        let issued = guard.issue().await.unwrap();
        assert!(!guard.validate(Some(issued.value.clone()), "forged").await.unwrap());
        assert!(!guard.validate(Some(issued.value.clone()), &issued.value).await.unwrap());
    }

    #[tokio::test]
    async fn unissued_or_absent_state_fails() {
        let (_, guard) = guard();
        assert!(!guard.validate(None, "anything").await.unwrap());
        assert!(!guard.validate(Some(String::new()), "").await.unwrap());
        assert!(!guard.validate(Some("made-up".into()), "made-up").await.unwrap());
    }

    #[tokio::test]
    async fn expired_state_is_rejected_by_the_server() {
        let (store, guard) = guard();
        let past = OffsetDateTime::now_utc() - Duration::seconds(1);
        store.put_oauth_state("stale", past).await.unwrap();
        assert!(!guard.validate(Some("stale".into()), "stale").await.unwrap());
    }

    #[test]
    fn clear_cookie_expires_state() {
        let cookie = clear_state_cookie(true);
        assert!(cookie.starts_with("github-oauth-state=;"));
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.ends_with("; Secure"));
    }
}
