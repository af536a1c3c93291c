//! Local-account operations behind the HTTP handlers.

use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{info, warn};
use url::form_urlencoded;
use uuid::Uuid;

use crate::{
    auth::{
        dto::{ChangePasswordRequest, LoginRequest, RegisterRequest, UpdateProfileRequest},
        password::{hash_password, verify_password, MIN_PASSWORD_LEN},
    },
    error::AuthError,
    store::{CredentialStore, NewUser, User},
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn check_password_policy(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn generated_avatar(name: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(name.as_bytes()).collect();
    format!("https://ui-avatars.com/api/?name={encoded}&background=random&size=256")
}

fn hash_or_internal(plain: &str) -> Result<String, AuthError> {
    hash_password(plain).map_err(|e| AuthError::Internal(e.to_string()))
}

pub async fn register(store: &dyn CredentialStore, req: RegisterRequest) -> Result<User, AuthError> {
    let name = req.name.trim().to_string();
    let email = normalize_email(&req.email);

    if name.is_empty() {
        return Err(AuthError::Validation("Name is required".into()));
    }
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AuthError::Validation("Invalid email".into()));
    }
    check_password_policy(&req.password)?;

    if store.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AuthError::EmailTaken);
    }
    if store.find_by_name(&name).await?.is_some() {
        return Err(AuthError::NameTaken);
    }

    let hash = hash_or_internal(&req.password)?;
    let user = store
        .insert(NewUser {
            avatar_url: Some(generated_avatar(&name)),
            email,
            name,
            password_hash: Some(hash),
            external: None,
            last_login: None,
        })
        .await?;
    info!(user_id = %user.id, "user registered");
    Ok(user)
}

/// Password login. Stamps `last_login` on success.
pub async fn authenticate(store: &dyn CredentialStore, req: LoginRequest) -> Result<User, AuthError> {
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        return Err(AuthError::Validation("Invalid email".into()));
    }

    let mut user = store.find_by_email(&email).await?.ok_or_else(|| {
        warn!(email = %email, "login unknown email");
        AuthError::UserNotFound
    })?;

    let Some(hash) = user.password_hash.as_deref() else {
        warn!(user_id = %user.id, "password login on provider-only account");
        return Err(AuthError::PasswordNotSet);
    };
    let ok = verify_password(&req.password, hash).map_err(|e| AuthError::Internal(e.to_string()))?;
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AuthError::InvalidCredentials);
    }

    let now = OffsetDateTime::now_utc();
    store.touch_last_login(user.id, now).await?;
    user.last_login = Some(now);
    info!(user_id = %user.id, "user logged in");
    Ok(user)
}

/// Current record for a session subject; a vanished user is unauthenticated.
pub async fn current_user(store: &dyn CredentialStore, id: Uuid) -> Result<User, AuthError> {
    store.find_by_id(id).await?.ok_or_else(|| {
        warn!(user_id = %id, "session for missing user");
        AuthError::NotAuthenticated
    })
}

pub async fn change_password(
    store: &dyn CredentialStore,
    user_id: Uuid,
    req: ChangePasswordRequest,
) -> Result<(), AuthError> {
    let user = current_user(store, user_id).await?;
    let Some(hash) = user.password_hash.as_deref() else {
        return Err(AuthError::PasswordNotSet);
    };
    check_password_policy(&req.new_password)?;

    let ok = verify_password(&req.current_password, hash)
        .map_err(|e| AuthError::Internal(e.to_string()))?;
    if !ok {
        warn!(user_id = %user.id, "password change with wrong current password");
        return Err(AuthError::Validation("Current password is incorrect".into()));
    }

    let fresh = hash_or_internal(&req.new_password)?;
    store.set_password_hash(user.id, &fresh).await?;
    info!(user_id = %user.id, "password changed");
    Ok(())
}

pub async fn update_profile(
    store: &dyn CredentialStore,
    user_id: Uuid,
    req: UpdateProfileRequest,
) -> Result<User, AuthError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AuthError::Validation("Name is required".into()));
    }
    let user = current_user(store, user_id).await?;
    if user.name == name {
        return Ok(user);
    }
    if let Some(other) = store.find_by_name(name).await? {
        if other.id != user.id {
            return Err(AuthError::NameTaken);
        }
    }
    let user = store.set_name(user.id, name).await?;
    info!(user_id = %user.id, "profile updated");
    Ok(user)
}
