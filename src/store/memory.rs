//! In-memory credential store for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CredentialStore, ExternalAccount, NewUser, Role, Status, StoreError, StoreResult,
    UniqueField, User,
};

#[derive(Default)]
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<Uuid, User>>,
    states: RwLock<HashMap<String, OffsetDateTime>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Overwrite a role directly, standing in for an administrator.
    pub async fn set_role(&self, id: Uuid, role: Role) {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.role = role;
        }
    }

    async fn find(&self, pred: impl Fn(&User) -> bool) -> Option<User> {
        self.users.read().await.values().find(|u| pred(u)).cloned()
    }
}

fn bound_to(user: &User, provider_user_id: &str) -> bool {
    user.external
        .as_ref()
        .is_some_and(|e| e.provider_user_id == provider_user_id)
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self.find(|u| u.email == email).await)
    }

    async fn find_by_name(&self, name: &str) -> StoreResult<Option<User>> {
        Ok(self.find(|u| u.name == name).await)
    }

    async fn find_by_provider_id(&self, provider_user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.find(|u| bound_to(u, provider_user_id)).await)
    }

    async fn insert(&self, new: NewUser) -> StoreResult<User> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == new.email) {
            return Err(StoreError::Duplicate(UniqueField::Email));
        }
        if let Some(ext) = &new.external {
            if users.values().any(|u| bound_to(u, &ext.provider_user_id)) {
                return Err(StoreError::Duplicate(UniqueField::ProviderUserId));
            }
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            name: new.name,
            password_hash: new.password_hash,
            external: new.external,
            avatar_url: new.avatar_url,
            role: Role::User,
            status: Status::Active,
            created_at: now,
            updated_at: now,
            last_login: new.last_login,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn link_external(
        &self,
        id: Uuid,
        external: &ExternalAccount,
        at: OffsetDateTime,
    ) -> StoreResult<User> {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|u| u.id != id && bound_to(u, &external.provider_user_id))
        {
            return Err(StoreError::Duplicate(UniqueField::ProviderUserId));
        }
        let user = users.get_mut(&id).ok_or(StoreError::Missing(id))?;
        if user
            .external
            .as_ref()
            .is_some_and(|e| e.provider_user_id != external.provider_user_id)
        {
            return Err(StoreError::LinkedElsewhere(id));
        }
        user.external = Some(external.clone());
        user.last_login = Some(at);
        user.updated_at = at;
        Ok(user.clone())
    }

    async fn touch_last_login(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<()> {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.last_login = Some(at);
        }
        Ok(())
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(StoreError::Missing(id))?;
        user.password_hash = Some(hash.to_string());
        user.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn set_name(&self, id: Uuid, name: &str) -> StoreResult<User> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(StoreError::Missing(id))?;
        user.name = name.to_string();
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }

    async fn put_oauth_state(&self, state: &str, expires_at: OffsetDateTime) -> StoreResult<()> {
        let mut states = self.states.write().await;
        let now = OffsetDateTime::now_utc();
        states.retain(|_, exp| *exp >= now);
        states.insert(state.to_string(), expires_at);
        Ok(())
    }

    async fn take_oauth_state(&self, state: &str) -> StoreResult<Option<OffsetDateTime>> {
        Ok(self.states.write().await.remove(state))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str, provider_id: Option<&str>) -> NewUser {
        NewUser {
            email: email.into(),
            name: email.into(),
            password_hash: None,
            external: provider_id.map(|id| ExternalAccount {
                provider: "github".into(),
                provider_user_id: id.into(),
                username: "u".into(),
                display_name: None,
                avatar_url: None,
            }),
            avatar_url: None,
            last_login: None,
        }
    }

    #[tokio::test]
    async fn insert_enforces_unique_email() {
        let store = InMemoryCredentialStore::new();
        store.insert(new_user("a@x.com", None)).await.unwrap();
        let err = store.insert(new_user("a@x.com", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(UniqueField::Email)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn insert_enforces_unique_provider_id() {
        let store = InMemoryCredentialStore::new();
        store.insert(new_user("a@x.com", Some("7"))).await.unwrap();
        let err = store.insert(new_user("b@x.com", Some("7"))).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(UniqueField::ProviderUserId)));
    }

    #[tokio::test]
    async fn link_external_rejects_id_bound_elsewhere() {
        let store = InMemoryCredentialStore::new();
        let bound = store.insert(new_user("a@x.com", Some("7"))).await.unwrap();
        let other = store.insert(new_user("b@x.com", None)).await.unwrap();
        let ext = bound.external.clone().unwrap();
        let err = store
            .link_external(other.id, &ext, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(UniqueField::ProviderUserId)));
        // relinking the same user is fine
        store
            .link_external(bound.id, &ext, OffsetDateTime::now_utc())
            .await
            .expect("relink owner");
    }

    #[tokio::test]
    async fn link_external_never_rebinds_a_linked_user() {
        let store = InMemoryCredentialStore::new();
        let bound = store.insert(new_user("a@x.com", Some("7"))).await.unwrap();
        let mut other = bound.external.clone().unwrap();
        other.provider_user_id = "8".into();
        let err = store
            .link_external(bound.id, &other, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LinkedElsewhere(id) if id == bound.id));
        let still = store.find_by_id(bound.id).await.unwrap().unwrap();
        assert_eq!(still.external.unwrap().provider_user_id, "7");
    }

    #[tokio::test]
    async fn oauth_state_is_taken_once() {
        let store = InMemoryCredentialStore::new();
        let exp = OffsetDateTime::now_utc() + time::Duration::minutes(10);
        store.put_oauth_state("s1", exp).await.unwrap();
        assert_eq!(store.take_oauth_state("s1").await.unwrap(), Some(exp));
        assert_eq!(store.take_oauth_state("s1").await.unwrap(), None);
    }
}
