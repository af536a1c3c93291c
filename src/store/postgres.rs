use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{
    CredentialStore, ExternalAccount, NewUser, StoreError, StoreResult, UniqueField, User,
};

const USER_COLUMNS: &str = "id, email, name, password_hash, provider, github_id, github_username, \
     github_name, github_avatar_url, avatar_url, role, status, created_at, updated_at, last_login";

/// Flat row as stored in the `users` table.
#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    name: String,
    password_hash: Option<String>,
    provider: Option<String>,
    github_id: Option<String>,
    github_username: Option<String>,
    github_name: Option<String>,
    github_avatar_url: Option<String>,
    avatar_url: Option<String>,
    role: String,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    last_login: Option<OffsetDateTime>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let external = match row.github_id {
            Some(provider_user_id) => Some(ExternalAccount {
                provider: row.provider.unwrap_or_else(|| "github".into()),
                provider_user_id,
                username: row.github_username.unwrap_or_default(),
                display_name: row.github_name,
                avatar_url: row.github_avatar_url,
            }),
            None => None,
        };
        Ok(User {
            id: row.id,
            email: row.email,
            name: row.name,
            password_hash: row.password_hash,
            external,
            avatar_url: row.avatar_url,
            role: row.role.parse().map_err(|e: String| anyhow!(e))?,
            status: row.status.parse().map_err(|e: String| anyhow!(e))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_login: row.last_login,
        })
    }
}

/// Maps unique violations onto the guarded field, everything else is opaque.
fn classify(err: sqlx::Error, what: &'static str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return match db_err.constraint() {
                Some("users_github_id_key") => StoreError::Duplicate(UniqueField::ProviderUserId),
                _ => StoreError::Duplicate(UniqueField::Email),
            };
        }
    }
    StoreError::Other(anyhow::Error::new(err).context(what))
}

/// Postgres-backed [`CredentialStore`].
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connect to database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("run migrations")?;
        Ok(())
    }

    async fn fetch_one_where(&self, clause: &str, value: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {clause} = $1 LIMIT 1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, "select user"))?;
        row.map(User::try_from).transpose()
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, "select user by id"))?;
        row.map(User::try_from).transpose()
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.fetch_one_where("email", email).await
    }

    async fn find_by_name(&self, name: &str) -> StoreResult<Option<User>> {
        self.fetch_one_where("name", name).await
    }

    async fn find_by_provider_id(&self, provider_user_id: &str) -> StoreResult<Option<User>> {
        self.fetch_one_where("github_id", provider_user_id).await
    }

    async fn insert(&self, user: NewUser) -> StoreResult<User> {
        let ext = user.external.as_ref();
        let sql = format!(
            r#"
            INSERT INTO users (email, name, password_hash, provider, github_id, github_username,
                               github_name, github_avatar_url, avatar_url, last_login)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(&user.email)
            .bind(&user.name)
            .bind(&user.password_hash)
            .bind(ext.map(|e| e.provider.as_str()))
            .bind(ext.map(|e| e.provider_user_id.as_str()))
            .bind(ext.map(|e| e.username.as_str()))
            .bind(ext.and_then(|e| e.display_name.as_deref()))
            .bind(ext.and_then(|e| e.avatar_url.as_deref()))
            .bind(&user.avatar_url)
            .bind(user.last_login)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(e, "insert user"))?;
        let created = User::try_from(row)?;
        debug!(user_id = %created.id, "user row inserted");
        Ok(created)
    }

    async fn link_external(
        &self,
        id: Uuid,
        external: &ExternalAccount,
        at: OffsetDateTime,
    ) -> StoreResult<User> {
        let sql = format!(
            r#"
            UPDATE users
            SET provider = $2, github_id = $3, github_username = $4, github_name = $5,
                github_avatar_url = $6, last_login = $7, updated_at = $7
            WHERE id = $1 AND (github_id IS NULL OR github_id = $3)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .bind(&external.provider)
            .bind(&external.provider_user_id)
            .bind(&external.username)
            .bind(&external.display_name)
            .bind(&external.avatar_url)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, "link external account"))?;
        match row {
            Some(row) => User::try_from(row),
            // no row: either gone or bound to someone else
            None => match self.find_by_id(id).await? {
                Some(_) => Err(StoreError::LinkedElsewhere(id)),
                None => Err(StoreError::Missing(id)),
            },
        }
    }

    async fn touch_last_login(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<()> {
        sqlx::query("UPDATE users SET last_login = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "touch last_login"))?;
        Ok(())
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> StoreResult<()> {
        let done = sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(hash)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "update password"))?;
        if done.rows_affected() == 0 {
            return Err(StoreError::Missing(id));
        }
        Ok(())
    }

    async fn set_name(&self, id: Uuid, name: &str) -> StoreResult<User> {
        let sql = format!(
            "UPDATE users SET name = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, "update name"))?
            .ok_or(StoreError::Missing(id))?;
        User::try_from(row)
    }

    async fn put_oauth_state(&self, state: &str, expires_at: OffsetDateTime) -> StoreResult<()> {
        sqlx::query("DELETE FROM oauth_states WHERE expires_at < now()")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "purge oauth states"))?;
        sqlx::query("INSERT INTO oauth_states (state, expires_at) VALUES ($1, $2)")
            .bind(state)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "insert oauth state"))?;
        Ok(())
    }

    async fn take_oauth_state(&self, state: &str) -> StoreResult<Option<OffsetDateTime>> {
        sqlx::query_scalar::<_, OffsetDateTime>(
            "DELETE FROM oauth_states WHERE state = $1 RETURNING expires_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, "take oauth state"))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
