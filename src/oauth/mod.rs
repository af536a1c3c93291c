//! GitHub authorization-code flow.
//!
//! `begin_authorization` covers `Idle -> AuthorizationRequested`: it mints a
//! CSRF state, records it in the credential store and builds the provider
//! URL. The
//! callback half is an explicit [`FlowState`] machine driven by
//! [`OAuthCoordinator::advance`], one provider round trip per transition.

pub mod transport;
mod types;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use url::form_urlencoded;

pub use transport::{TokenExchangeTransport, TransportError};
pub use types::{ExternalIdentity, ProviderUser};

use crate::{
    auth::csrf::CsrfStateGuard,
    config::OAuthConfig,
    store::{CredentialStore, StoreError},
};
use types::select_verified_email;

pub const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
pub const SCOPES: &str = "read:user user:email";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OAuthError {
    #[error("Invalid or missing OAuth state")]
    InvalidState,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(TransportError),

    #[error("Profile fetch failed: {0}")]
    ProfileFetchFailed(TransportError),

    #[error("No verified email on the GitHub account")]
    NoVerifiedEmail,

    #[error("OAuth state storage failed: {0}")]
    StateStoreFailed(String),
}

/// Callback-side states. Each step runs only after the previous one resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    CallbackReceived {
        code: String,
        received_state: String,
        stored_state: Option<String>,
    },
    TokenExchanged {
        access_token: String,
    },
    ProfileFetched {
        access_token: String,
        user: ProviderUser,
    },
    EmailResolved {
        user: ProviderUser,
        email: String,
    },
    Complete(ExternalIdentity),
    Failed(OAuthError),
}

impl FlowState {
    pub fn name(&self) -> &'static str {
        match self {
            FlowState::CallbackReceived { .. } => "callback_received",
            FlowState::TokenExchanged { .. } => "token_exchanged",
            FlowState::ProfileFetched { .. } => "profile_fetched",
            FlowState::EmailResolved { .. } => "email_resolved",
            FlowState::Complete(_) => "complete",
            FlowState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct AuthorizationRequest {
    pub url: String,
    /// `Set-Cookie` value carrying the state.
    pub state_cookie: String,
}

pub struct OAuthCoordinator {
    client_id: String,
    redirect_uri: String,
    guard: CsrfStateGuard,
    transport: Arc<dyn TokenExchangeTransport>,
}

impl OAuthCoordinator {
    pub fn new(
        cfg: &OAuthConfig,
        guard: CsrfStateGuard,
        transport: Arc<dyn TokenExchangeTransport>,
    ) -> Self {
        Self {
            client_id: cfg.client_id.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
            guard,
            transport,
        }
    }

    pub fn from_config(
        cfg: &OAuthConfig,
        secure_cookie: bool,
        store: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let transport = transport::from_config(cfg)?;
        Ok(Self::new(cfg, CsrfStateGuard::new(store, secure_cookie), transport))
    }

    pub fn uses_proxy(&self) -> bool {
        self.transport.is_proxied()
    }

    pub async fn begin_authorization(&self) -> Result<AuthorizationRequest, StoreError> {
        let state = self.guard.issue().await?;
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", &state.value)
            .append_pair("scope", SCOPES)
            .finish();
        Ok(AuthorizationRequest {
            url: format!("{GITHUB_AUTHORIZE_URL}?{query}"),
            state_cookie: state.cookie,
        })
    }

    /// Runs the callback to completion. The stored state is consumed here.
    pub async fn handle_callback(
        &self,
        code: &str,
        received_state: &str,
        stored_state: Option<String>,
    ) -> Result<ExternalIdentity, OAuthError> {
        let mut flow = FlowState::CallbackReceived {
            code: code.to_string(),
            received_state: received_state.to_string(),
            stored_state,
        };
        loop {
            match flow {
                FlowState::Complete(identity) => return Ok(identity),
                FlowState::Failed(err) => {
                    warn!(error = %err, "oauth callback failed");
                    return Err(err);
                }
                pending => {
                    let from = pending.name();
                    flow = self.advance(pending).await;
                    info!(from, to = flow.name(), proxied = self.uses_proxy(), "oauth transition");
                }
            }
        }
    }

    /// Performs exactly one transition.
    pub async fn advance(&self, flow: FlowState) -> FlowState {
        match flow {
            FlowState::CallbackReceived {
                code,
                received_state,
                stored_state,
            } => {
                match self.guard.validate(stored_state, &received_state).await {
                    Ok(true) => {}
                    Ok(false) => return FlowState::Failed(OAuthError::InvalidState),
                    Err(e) => return FlowState::Failed(OAuthError::StateStoreFailed(e.to_string())),
                }
                if code.trim().is_empty() {
                    return FlowState::Failed(OAuthError::TokenExchangeFailed(
                        TransportError::Rejected("missing authorization code".into()),
                    ));
                }
                match self.transport.exchange_code(&code).await {
                    Ok(access_token) => FlowState::TokenExchanged { access_token },
                    Err(e) => FlowState::Failed(OAuthError::TokenExchangeFailed(e)),
                }
            }
            FlowState::TokenExchanged { access_token } => {
                let profile = match self.transport.fetch_profile(&access_token).await {
                    Ok(p) => p,
                    Err(e) => return FlowState::Failed(OAuthError::ProfileFetchFailed(e)),
                };
                let Some(id) = profile.stable_id() else {
                    return FlowState::Failed(OAuthError::ProfileFetchFailed(
                        TransportError::Malformed("profile has no user id".into()),
                    ));
                };
                let login = profile.login.clone().unwrap_or_else(|| id.clone());
                FlowState::ProfileFetched {
                    access_token,
                    user: ProviderUser {
                        id,
                        login,
                        name: profile.name.filter(|n| !n.trim().is_empty()),
                        avatar_url: profile.avatar_url,
                        email: profile.email,
                    },
                }
            }
            FlowState::ProfileFetched { access_token, user } => {
                let emails = match self.transport.fetch_emails(&access_token).await {
                    Ok(list) => list,
                    Err(e) => return FlowState::Failed(OAuthError::ProfileFetchFailed(e)),
                };
                match select_verified_email(&emails, user.email.as_deref()) {
                    Some(email) => FlowState::EmailResolved { user, email },
                    None => FlowState::Failed(OAuthError::NoVerifiedEmail),
                }
            }
            FlowState::EmailResolved { user, email } => FlowState::Complete(ExternalIdentity {
                provider_user_id: user.id,
                username: user.login,
                display_name: user.name,
                avatar_url: user.avatar_url,
                verified_email: email,
            }),
            terminal => terminal,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{coordinator, issued_state, ProviderEmail, StubTransport};
    use super::*;
    use crate::store::memory::InMemoryCredentialStore;
    use serde_json::json;

    fn setup(stub: StubTransport) -> (Arc<StubTransport>, OAuthCoordinator) {
        let stub = Arc::new(stub);
        let c = coordinator(stub.clone(), Arc::new(InMemoryCredentialStore::new()));
        (stub, c)
    }

    fn ann() -> StubTransport {
        StubTransport::github_user(42, "ann", "ann@x.com")
    }

    #[tokio::test]
    async fn authorization_url_carries_client_scopes_and_state() {
        let (_, c) = setup(StubTransport::github_user(1, "a", "a@x.com"));
        let req = c.begin_authorization().await.unwrap();
        let url = url::Url::parse(&req.url).unwrap();
        let q: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert!(req.url.starts_with(GITHUB_AUTHORIZE_URL));
        assert_eq!(q["client_id"], "client-123");
        assert_eq!(q["redirect_uri"], "http://localhost:8080/auth/oauth/callback");
        assert_eq!(q["scope"], SCOPES);
        assert!(req.state_cookie.contains(&format!("={};", q["state"])));
    }

    #[tokio::test]
    async fn full_flow_yields_normalized_identity() {
        let (stub, c) = setup(StubTransport::github_user(42, "ann", "Ann@X.com"));
        let st = issued_state(&c).await;
        let identity = c
            .handle_callback("code", &st, Some(st.clone()))
            .await
            .expect("flow completes");
        assert_eq!(identity.provider_user_id, "42");
        assert_eq!(identity.username, "ann");
        assert_eq!(identity.display_name, None);
        assert_eq!(identity.verified_email, "ann@x.com");
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn replayed_state_stops_before_token_exchange() {
        let (stub, c) = setup(ann());
        let st = issued_state(&c).await;
        c.handle_callback("code", &st, Some(st.clone())).await.unwrap();
        let err = c
            .handle_callback("code", &st, Some(st.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, OAuthError::InvalidState);
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn state_mismatch_stops_before_token_exchange() {
        let (stub, c) = setup(ann());
        let st = issued_state(&c).await;
        let err = c
            .handle_callback("code", "forged", Some(st.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, OAuthError::InvalidState);
        assert_eq!(stub.calls(), 0);

        let err = c.handle_callback("code", &st, None).await.unwrap_err();
        assert_eq!(err, OAuthError::InvalidState);

        // a cookie the server never issued
        let err = c
            .handle_callback("code", "made-up", Some("made-up".into()))
            .await
            .unwrap_err();
        assert_eq!(err, OAuthError::InvalidState);
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn token_errors_are_terminal() {
        let mut stub = ann();
        stub.token = Err(TransportError::Rejected("bad_verification_code".into()));
        let (stub, c) = setup(stub);
        let st = issued_state(&c).await;
        let err = c.handle_callback("code", &st, Some(st.clone())).await.unwrap_err();
        assert!(matches!(err, OAuthError::TokenExchangeFailed(_)));
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn profile_without_id_fails() {
        let mut stub = ann();
        stub.profile = Ok(json!({ "login": "ann" }));
        let (_, c) = setup(stub);
        let next = c
            .advance(FlowState::TokenExchanged {
                access_token: "t".into(),
            })
            .await;
        assert!(matches!(
            next,
            FlowState::Failed(OAuthError::ProfileFetchFailed(TransportError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn only_unverified_emails_fail_with_no_verified_email() {
        let mut stub = ann();
        stub.emails = Ok(vec![ProviderEmail {
            email: "ann@x.com".into(),
            primary: true,
            verified: false,
        }]);
        let (_, c) = setup(stub);
        let st = issued_state(&c).await;
        let err = c.handle_callback("code", &st, Some(st.clone())).await.unwrap_err();
        assert_eq!(err, OAuthError::NoVerifiedEmail);
    }

    #[tokio::test]
    async fn email_fetch_timeout_is_profile_failure() {
        let mut stub = ann();
        stub.emails = Err(TransportError::Unreachable("operation timed out".into()));
        let (_, c) = setup(stub);
        let user = ProviderUser {
            id: "42".into(),
            login: "ann".into(),
            name: None,
            avatar_url: None,
            email: None,
        };
        let next = c
            .advance(FlowState::ProfileFetched {
                access_token: "t".into(),
                user,
            })
            .await;
        assert_eq!(
            next,
            FlowState::Failed(OAuthError::ProfileFetchFailed(TransportError::Unreachable(
                "operation timed out".into()
            )))
        );
    }

    #[tokio::test]
    async fn terminal_states_do_not_move() {
        let (_, c) = setup(StubTransport::github_user(1, "a", "a@x.com"));
        let failed = FlowState::Failed(OAuthError::InvalidState);
        assert_eq!(c.advance(failed.clone()).await, failed);
    }
}
