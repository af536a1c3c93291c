use anyhow::{bail, Context};

/// Sessions last at most a week.
pub const MAX_SESSION_TTL_MINUTES: i64 = 7 * 24 * 60;
const DEFAULT_SESSION_TTL_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub secure_cookie: bool,
}

/// Provider credentials plus the transport selection.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// When set, provider calls go through this relay instead of GitHub.
    pub proxy_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub session: SessionConfig,
    pub oauth: Option<OAuthConfig>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = var("DATABASE_URL").context("DATABASE_URL not set")?;

        let secret = var("JWT_SECRET").context("JWT_SECRET not set")?;
        if secret.trim().is_empty() {
            bail!("JWT_SECRET must not be empty");
        }
        let ttl_minutes = match var("SESSION_TTL_MINUTES") {
            None => DEFAULT_SESSION_TTL_MINUTES,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(m) if (1..=MAX_SESSION_TTL_MINUTES).contains(&m) => m,
                _ => bail!(
                    "SESSION_TTL_MINUTES must be between 1 and {MAX_SESSION_TTL_MINUTES}, got {raw:?}"
                ),
            },
        };
        let session = SessionConfig {
            secret,
            issuer: var("JWT_ISSUER").unwrap_or_else(|| "quill".into()),
            audience: var("JWT_AUDIENCE").unwrap_or_else(|| "quill-users".into()),
            ttl_minutes,
            secure_cookie: var("APP_ENV").is_some_and(|v| v == "production"),
        };

        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        let oauth = match (non_empty("GITHUB_CLIENT_ID"), non_empty("GITHUB_CLIENT_SECRET")) {
            (None, None) => None,
            (Some(client_id), Some(client_secret)) => {
                let redirect_uri = match non_empty("OAUTH_REDIRECT_URI") {
                    Some(uri) => uri,
                    None => {
                        let site = non_empty("SITE_URL")
                            .context("OAUTH_REDIRECT_URI or SITE_URL required for OAuth")?;
                        format!("{}/auth/oauth/callback", site.trim_end_matches('/'))
                    }
                };
                Some(OAuthConfig {
                    client_id,
                    client_secret,
                    redirect_uri,
                    proxy_url: non_empty("GITHUB_PROXY_SERVICE_URL")
                        .map(|u| u.trim_end_matches('/').to_string()),
                    timeout_secs: var("OAUTH_HTTP_TIMEOUT_SECS")
                        .and_then(|v| v.parse::<u64>().ok())
                        .filter(|s| *s > 0)
                        .unwrap_or(10),
                })
            }
            _ => bail!("GITHUB_CLIENT_ID and GITHUB_CLIENT_SECRET must be set together"),
        };

        Ok(Self {
            database_url,
            session,
            oauth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    const BASE: [(&str, &str); 2] = [("DATABASE_URL", "postgres://x"), ("JWT_SECRET", "s3cret")];

    #[test]
    fn defaults_without_oauth() {
        let cfg = load(&BASE).unwrap();
        assert!(cfg.oauth.is_none());
        assert_eq!(cfg.session.ttl_minutes, 1440);
        assert!(!cfg.session.secure_cookie);
    }

    #[test]
    fn half_configured_provider_fails_fast() {
        let mut vars = BASE.to_vec();
        vars.push(("GITHUB_CLIENT_ID", "id"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn proxy_url_and_site_redirect() {
        let mut vars = BASE.to_vec();
        vars.extend([
            ("GITHUB_CLIENT_ID", "id"),
            ("GITHUB_CLIENT_SECRET", "secret"),
            ("SITE_URL", "https://blog.example/"),
            ("GITHUB_PROXY_SERVICE_URL", "https://relay.example/"),
            ("APP_ENV", "production"),
        ]);
        let cfg = load(&vars).unwrap();
        let oauth = cfg.oauth.unwrap();
        assert_eq!(oauth.redirect_uri, "https://blog.example/auth/oauth/callback");
        assert_eq!(oauth.proxy_url.as_deref(), Some("https://relay.example"));
        assert_eq!(oauth.timeout_secs, 10);
        assert!(cfg.session.secure_cookie);
    }

    #[test]
    fn session_ttl_is_bounded() {
        let with_ttl = |ttl: &'static str| {
            let mut vars = BASE.to_vec();
            vars.push(("SESSION_TTL_MINUTES", ttl));
            load(&vars)
        };
        assert_eq!(with_ttl("10080").unwrap().session.ttl_minutes, MAX_SESSION_TTL_MINUTES);
        assert_eq!(with_ttl("90").unwrap().session.ttl_minutes, 90);
        assert!(with_ttl("10081").is_err());
        assert!(with_ttl("9223372036854775807").is_err());
        assert!(with_ttl("0").is_err());
        assert!(with_ttl("a day").is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(load(&[("DATABASE_URL", "postgres://x"), ("JWT_SECRET", " ")]).is_err());
    }
}
