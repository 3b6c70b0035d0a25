//! Storage seams for the lifecycle engine.
//!
//! The engine talks to two kinds of storage:
//!
//! - A fast keyed-TTL **cache** ([`CacheBackend`]) holding blacklist entries,
//!   exchange codes and rate-limit counters. Entries expire natively.
//! - A **durable** store holding refresh tokens, sessions, blacklist rows, users and
//!   applications ([`RefreshTokenStore`], [`RevocationRepository`], [`SessionStore`],
//!   [`UserStore`], [`ApplicationStore`]).
//!
//! [`memory`] implements every trait in process; [`postgres`] implements the durable
//! traits over `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::{MemoryCache, MemoryStore};
pub use models::{
    Application, RefreshToken, RevocationEntry, Session, TokenExchangeCode, User,
};
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{backend} backend unavailable")]
    Unavailable { backend: &'static str },
    #[error("duplicate {0}")]
    Conflict(&'static str),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed-TTL cache. A missing key is `Ok(None)`/`Ok(false)`, never an error.
///
/// This is the full interface a cache backend offers, in Redis terms `SET EX`,
/// `GET`, `EXISTS`, `DEL`, `GETDEL`, `SET NX EX` and `INCR` + `EXPIRE`. The
/// lifecycle engine itself uses `set`, `exists`, `take` and `increment_window`;
/// `get`, `delete` and `set_nx` are there for embedders sharing the cache, such
/// as an authorization-code flow parking PKCE challenges.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically read and remove a key. At most one caller observes the value.
    async fn take(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set only when the key is absent. Returns `true` when the value was stored.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Increment a counter whose window starts at the first increment.
    /// Returns the count after incrementing.
    async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<u64>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn create_refresh_token(&self, token: &RefreshToken) -> StoreResult<()>;

    async fn refresh_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>>;

    /// Mark a token revoked. Returns `false` when it was missing or already revoked.
    async fn revoke_refresh_token(&self, token_hash: &str) -> StoreResult<bool>;

    /// Revoke `old_hash` and insert `successor` in one step.
    /// Returns `false` (and inserts nothing) when `old_hash` was already revoked.
    async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        successor: &RefreshToken,
    ) -> StoreResult<bool>;

    /// Revoke every active refresh token of a user. Returns the number revoked.
    async fn revoke_all_user_tokens(&self, user_id: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait RevocationRepository: Send + Sync {
    async fn add_to_blacklist(&self, entry: &RevocationEntry) -> StoreResult<()>;

    async fn is_blacklisted(&self, token_hash: &str) -> StoreResult<bool>;

    /// All entries whose `expires_at` is still in the future.
    async fn active_blacklist_entries(&self) -> StoreResult<Vec<RevocationEntry>>;

    /// Delete entries past `expires_at`. Returns the number deleted.
    async fn purge_expired_blacklist(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> StoreResult<()>;

    /// Active (non-revoked) session paired with a refresh token hash.
    async fn session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>>;

    async fn session_by_id(&self, session_id: Uuid) -> StoreResult<Option<Session>>;

    async fn revoke_session(&self, session_id: Uuid) -> StoreResult<()>;

    async fn revoke_user_sessions(&self, user_id: Uuid) -> StoreResult<u64>;

    /// Move an active session onto rotated token hashes. Returns `false` when no
    /// active session matched `old_token_hash`.
    async fn refresh_session_tokens(
        &self,
        old_token_hash: &str,
        new_token_hash: &str,
        new_access_token_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Active sessions of a user, most recently active first.
    async fn user_sessions(&self, user_id: Uuid) -> StoreResult<Vec<Session>>;

    /// Delete sessions that expired or were revoked before `cutoff`.
    async fn delete_expired_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Load a user together with role names.
    async fn user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>>;

    /// Returns `false` when the user does not exist.
    async fn update_password_hash(&self, user_id: Uuid, password_hash: &str)
        -> StoreResult<bool>;
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn application_by_id(&self, app_id: Uuid) -> StoreResult<Option<Application>>;
}
