//! Maps a verified provider identity onto exactly one local user.

use rand::Rng;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    error::AuthError,
    oauth::ExternalIdentity,
    store::{CredentialStore, ExternalAccount, NewUser, StoreError, User},
};

pub const PROVIDER: &str = "github";
/// Resolution rounds allowed after losing an insert race.
const MAX_ATTEMPTS: usize = 3;

enum Attempt {
    Resolved(User),
    /// The email's account is bound to a different provider user.
    Conflict,
}

pub struct IdentityLinker<'a> {
    store: &'a dyn CredentialStore,
}

impl<'a> IdentityLinker<'a> {
    pub fn new(store: &'a dyn CredentialStore) -> Self {
        Self { store }
    }

    /// Find-or-create. Re-running with the same identity returns the same user.
    pub async fn resolve(&self, identity: &ExternalIdentity) -> Result<User, AuthError> {
        let account = ExternalAccount {
            provider: PROVIDER.to_string(),
            provider_user_id: identity.provider_user_id.clone(),
            username: identity.username.clone(),
            display_name: identity.display_name.clone(),
            avatar_url: identity.avatar_url.clone(),
        };
        let email = identity.verified_email.trim().to_lowercase();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_resolve(&account, &email).await {
                Ok(Attempt::Resolved(user)) => return Ok(user),
                Ok(Attempt::Conflict) => return Err(AuthError::IdentityConflict),
                Err(StoreError::Duplicate(field)) => {
                    debug!(attempt, ?field, "lost creation race, resolving again");
                }
                Err(StoreError::LinkedElsewhere(user_id)) => {
                    warn!(%user_id, "account was linked elsewhere while resolving");
                    return Err(AuthError::IdentityConflict);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthError::Internal(format!(
            "provider user {} still unresolved after {MAX_ATTEMPTS} attempts",
            account.provider_user_id
        )))
    }

    async fn try_resolve(&self, account: &ExternalAccount, email: &str) -> Result<Attempt, StoreError> {
        let now = OffsetDateTime::now_utc();

        if let Some(user) = self.store.find_by_provider_id(&account.provider_user_id).await? {
            debug!(user_id = %user.id, "matched by provider id");
            let user = self.store.link_external(user.id, account, now).await?;
            return Ok(Attempt::Resolved(user));
        }

        if let Some(user) = self.store.find_by_email(email).await? {
            if let Some(bound) = &user.external {
                if bound.provider_user_id != account.provider_user_id {
                    warn!(user_id = %user.id, "email belongs to an account linked elsewhere");
                    return Ok(Attempt::Conflict);
                }
            }
            info!(user_id = %user.id, "linking provider account to existing user");
            let user = self.store.link_external(user.id, account, now).await?;
            return Ok(Attempt::Resolved(user));
        }

        let base = account
            .display_name
            .clone()
            .unwrap_or_else(|| account.username.clone());
        let name = self.available_name(&base).await?;
        let user = self
            .store
            .insert(NewUser {
                email: email.to_string(),
                name,
                password_hash: None,
                external: Some(account.clone()),
                avatar_url: account.avatar_url.clone(),
                last_login: Some(now),
            })
            .await?;
        info!(user_id = %user.id, "user created from provider identity");
        Ok(Attempt::Resolved(user))
    }

    // A suffixed name is not checked again.
    async fn available_name(&self, base: &str) -> Result<String, StoreError> {
        if self.store.find_by_name(base).await?.is_none() {
            return Ok(base.to_string());
        }
        let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
        Ok(format!("{base}{suffix}"))
    }
}
