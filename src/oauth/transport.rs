//! Provider HTTP transports. Chosen once at startup: either this server calls
//! GitHub directly, or a relay reachable from this network calls it for us.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use super::types::{ProviderEmail, ProviderProfile, TokenResponse};
use crate::config::OAuthConfig;

pub const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "quill-auth";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The provider refused the request (bad code, revoked token).
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// Network failure, timeout or provider-side 5xx.
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Malformed(e.to_string())
        } else {
            TransportError::Unreachable(e.to_string())
        }
    }
}

#[async_trait]
pub trait TokenExchangeTransport: Send + Sync {
    fn is_proxied(&self) -> bool;

    async fn exchange_code(&self, code: &str) -> Result<String, TransportError>;

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile, TransportError>;

    async fn fetch_emails(&self, access_token: &str) -> Result<Vec<ProviderEmail>, TransportError>;
}

/// Builds the transport the configuration asks for.
pub fn from_config(cfg: &OAuthConfig) -> anyhow::Result<Arc<dyn TokenExchangeTransport>> {
    let client = ProviderClient::new(cfg)?;
    Ok(match &cfg.proxy_url {
        Some(base) => Arc::new(ProxiedTransport {
            client,
            base_url: base.clone(),
        }),
        None => Arc::new(DirectTransport {
            client,
            token_url: GITHUB_TOKEN_URL.to_string(),
            api_base: GITHUB_API_BASE.to_string(),
        }),
    })
}

/// HTTP plumbing shared by both transports.
struct ProviderClient {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl ProviderClient {
    fn new(cfg: &OAuthConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
        })
    }

    async fn post_code(&self, url: &str, code: &str) -> Result<String, TransportError> {
        let res = self
            .http
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(&json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "code": code,
                "redirect_uri": self.redirect_uri,
            }))
            .send()
            .await?;
        let body: TokenResponse = read_json(res).await?;
        token_from(body)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, TransportError> {
        let res = self
            .http
            .get(url)
            .header(header::ACCEPT, "application/json")
            .header(header::AUTHORIZATION, format!("token {access_token}"))
            .send()
            .await?;
        read_json(res).await
    }
}

async fn read_json<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, TransportError> {
    let status = res.status();
    debug!(%status, url = %res.url(), "provider response");
    if status.is_server_error() {
        return Err(TransportError::Unreachable(status.to_string()));
    }
    if status.is_client_error() {
        return Err(TransportError::Rejected(status.to_string()));
    }
    if status != StatusCode::OK {
        return Err(TransportError::Malformed(status.to_string()));
    }
    Ok(res.json::<T>().await?)
}

fn token_from(body: TokenResponse) -> Result<String, TransportError> {
    if let Some(code) = body.error {
        return Err(TransportError::Rejected(body.error_description.unwrap_or(code)));
    }
    body.access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TransportError::Malformed("no access_token in response".into()))
}

/// Talks to GitHub itself.
pub struct DirectTransport {
    client: ProviderClient,
    token_url: String,
    api_base: String,
}

#[async_trait]
impl TokenExchangeTransport for DirectTransport {
    fn is_proxied(&self) -> bool {
        false
    }

    async fn exchange_code(&self, code: &str) -> Result<String, TransportError> {
        self.client.post_code(&self.token_url, code).await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile, TransportError> {
        let url = format!("{}/user", self.api_base);
        self.client.get_json(&url, access_token).await
    }

    async fn fetch_emails(&self, access_token: &str) -> Result<Vec<ProviderEmail>, TransportError> {
        let url = format!("{}/user/emails", self.api_base);
        self.client.get_json(&url, access_token).await
    }
}

/// Talks to a relay exposing `/token`, `/user` and `/emails`.
pub struct ProxiedTransport {
    client: ProviderClient,
    base_url: String,
}

#[async_trait]
impl TokenExchangeTransport for ProxiedTransport {
    fn is_proxied(&self) -> bool {
        true
    }

    async fn exchange_code(&self, code: &str) -> Result<String, TransportError> {
        let url = format!("{}/token", self.base_url);
        self.client.post_code(&url, code).await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile, TransportError> {
        let url = format!("{}/user", self.base_url);
        self.client.get_json(&url, access_token).await
    }

    async fn fetch_emails(&self, access_token: &str) -> Result<Vec<ProviderEmail>, TransportError> {
        let url = format!("{}/emails", self.base_url);
        self.client.get_json(&url, access_token).await
    }
}
