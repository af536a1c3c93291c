use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token endpoint reply. GitHub answers 200 even for failures and
/// reports them in `error`.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Raw `/user` payload. `id` is numeric on GitHub but relays may stringify it.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderProfile {
    pub id: Option<Value>,
    pub login: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

impl ProviderProfile {
    /// Stable provider user id, if the payload carries a usable one.
    pub fn stable_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }
}

/// Entry of the `/user/emails` list.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEmail {
    pub email: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub verified: bool,
}

/// Profile after the id check, carried between flow steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUser {
    pub id: String,
    pub login: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

/// Normalized outcome of a successful callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalIdentity {
    pub provider_user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub verified_email: String,
}

/// First primary+verified address; otherwise the profile email, but only
/// when the list vouches for it as verified.
pub fn select_verified_email(emails: &[ProviderEmail], profile_email: Option<&str>) -> Option<String> {
    let primary = emails.iter().find(|e| e.primary && e.verified);
    let fallback = || {
        let wanted = profile_email?.trim();
        emails
            .iter()
            .find(|e| e.verified && e.email.eq_ignore_ascii_case(wanted))
    };
    primary
        .or_else(fallback)
        .map(|e| e.email.trim().to_lowercase())
        .filter(|e| !e.is_empty())
}
