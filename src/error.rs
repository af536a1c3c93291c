//! HTTP-facing error taxonomy.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::{
    auth::session::SessionError,
    oauth::{OAuthError, TransportError},
    store::{StoreError, UniqueField},
};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("This account was created with GitHub, sign in with GitHub instead")]
    PasswordNotSet,

    #[error("User not found")]
    UserNotFound,

    #[error("Email already registered")]
    EmailTaken,

    #[error("Name already taken")]
    NameTaken,

    #[error("Account is already linked to a different GitHub user")]
    IdentityConflict,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(UniqueField::Email) => AuthError::EmailTaken,
            StoreError::Duplicate(UniqueField::ProviderUserId) | StoreError::LinkedElsewhere(_) => {
                AuthError::IdentityConflict
            }
            StoreError::Missing(_) => AuthError::UserNotFound,
            other => AuthError::Store(other),
        }
    }
}

impl From<JsonRejection> for AuthError {
    fn from(rejection: JsonRejection) -> Self {
        AuthError::Validation(rejection.body_text())
    }
}

fn upstream_status(err: &TransportError) -> StatusCode {
    match err {
        TransportError::Rejected(_) => StatusCode::BAD_REQUEST,
        TransportError::Unreachable(_) | TransportError::Malformed(_) => StatusCode::BAD_GATEWAY,
    }
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials
            | AuthError::PasswordNotSet
            | AuthError::NotAuthenticated
            | AuthError::Session(_) => StatusCode::UNAUTHORIZED,
            AuthError::UserNotFound => StatusCode::NOT_FOUND,
            AuthError::EmailTaken | AuthError::NameTaken | AuthError::IdentityConflict => {
                StatusCode::CONFLICT
            }
            AuthError::OAuth(OAuthError::InvalidState | OAuthError::NoVerifiedEmail) => {
                StatusCode::BAD_REQUEST
            }
            AuthError::OAuth(
                OAuthError::TokenExchangeFailed(t) | OAuthError::ProfileFetchFailed(t),
            ) => upstream_status(t),
            AuthError::OAuth(OAuthError::StateStoreFailed(_))
            | AuthError::NotConfigured(_)
            | AuthError::Store(_)
            | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AuthError::PasswordNotSet => json!({ "error": self.to_string(), "githubUser": true }),
            AuthError::Store(e) => {
                tracing::error!(error = ?e, "datastore failure");
                json!({ "error": "Internal server error" })
            }
            AuthError::OAuth(OAuthError::StateStoreFailed(msg)) | AuthError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                json!({ "error": "Internal server error" })
            }
            AuthError::NotConfigured(what) => {
                tracing::error!(%what, "missing configuration");
                json!({ "error": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
