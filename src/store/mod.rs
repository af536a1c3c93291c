//! Credential storage: the single shared source of truth for identities.

mod models;
pub mod postgres;
#[cfg(test)]
pub mod memory;

pub use models::*;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Column guarded by a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Email,
    ProviderUserId,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {0:?}")]
    Duplicate(UniqueField),

    #[error("user {0} not found")]
    Missing(Uuid),

    /// The user is already bound to a different external account.
    #[error("user {0} is linked to another external account")]
    LinkedElsewhere(Uuid),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Datastore contract used by every auth component.
///
/// Implementations must reject a second user with the same `email` or the
/// same external `provider_user_id` with [`StoreError::Duplicate`].
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn find_by_name(&self, name: &str) -> StoreResult<Option<User>>;

    async fn find_by_provider_id(&self, provider_user_id: &str) -> StoreResult<Option<User>>;

    async fn insert(&self, user: NewUser) -> StoreResult<User>;

    /// Bind or refresh the external account and stamp `last_login`.
    /// Leaves email, role and the local credential untouched. Fails with
    /// [`StoreError::LinkedElsewhere`] if the user already carries a
    /// different `provider_user_id`; the check and the write are one step.
    async fn link_external(
        &self,
        id: Uuid,
        external: &ExternalAccount,
        at: OffsetDateTime,
    ) -> StoreResult<User>;

    async fn touch_last_login(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<()>;

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> StoreResult<()>;

    async fn set_name(&self, id: Uuid, name: &str) -> StoreResult<User>;

    /// Record an issued OAuth state until `expires_at`.
    async fn put_oauth_state(&self, state: &str, expires_at: OffsetDateTime) -> StoreResult<()>;

    /// Remove a state and return its expiry. A second take of the same
    /// state returns `None`.
    async fn take_oauth_state(&self, state: &str) -> StoreResult<Option<OffsetDateTime>>;

    /// Release connections on shutdown.
    async fn close(&self);
}
