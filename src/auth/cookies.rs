use axum::http::header::{HeaderMap, HeaderValue, SET_COOKIE};
use axum_extra::headers::{Cookie, HeaderMapExt};

use crate::error::AuthError;

pub const SESSION_COOKIE: &str = "auth-token";
pub const CSRF_COOKIE: &str = "github-oauth-state";

/// Builds an HTTP-only `Set-Cookie` value scoped to the whole site.
pub fn build_cookie(name: &str, value: &str, max_age: i64, secure: bool) -> String {
    let mut cookie = format!("{name}={value}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn append_cookie(headers: &mut HeaderMap, cookie: &str) -> Result<(), AuthError> {
    let value = HeaderValue::from_str(cookie)
        .map_err(|_| AuthError::Internal("failed to encode cookie".into()))?;
    headers.append(SET_COOKIE, value);
    Ok(())
}

/// Expires a cookie on the client.
pub fn removal_cookie(name: &str, secure: bool) -> String {
    build_cookie(name, "", 0, secure)
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .typed_get::<Cookie>()
        .and_then(|c| c.get(name).map(str::to_string))
        .filter(|v| !v.is_empty())
}
