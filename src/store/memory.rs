//! In-process backends.
//!
//! [`MemoryCache`] is the keyed-TTL cache used by a single-node deployment and by the
//! test suite. [`MemoryStore`] mirrors the durable Postgres store. Both can be switched
//! off with `set_available(false)` to exercise partial-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::{
    future::Cache,
    ops::compute::{CompResult, Op},
    Expiry,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    Application, ApplicationStore, CacheBackend, RefreshToken, RefreshTokenStore,
    RevocationEntry, RevocationRepository, Session, SessionStore, StoreError, StoreResult, User,
    UserStore,
};

/// Default upper bound on cached keys.
///
/// Blacklist entries share this bound with exchange codes and rate counters, so it
/// must stay above the number of live revocations.
pub const DEFAULT_CACHE_MAX_CAPACITY: u64 = 1_000_000;

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
    // Lifetime left at the moment of the last write; drives eviction.
    time_to_live: Duration,
}

impl CacheEntry {
    fn new(value: String, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + ttl,
            time_to_live: ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Evicts each entry once its own TTL has elapsed.
struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.time_to_live)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.time_to_live)
    }
}

/// Keyed-TTL cache on [`moka`].
///
/// moka evicts entries when their TTL elapses or the capacity is reached. Reads
/// also compare against the entry's deadline, so an entry is never served past its
/// TTL even before eviction runs.
pub struct MemoryCache {
    entries: Cache<String, CacheEntry>,
    available: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_capacity(DEFAULT_CACHE_MAX_CAPACITY)
    }

    #[must_use]
    pub fn with_max_capacity(max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .name("tokengate-cache")
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop every entry, as a cache restart would.
    pub async fn flush(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }

    /// Number of entries held after pending evictions have run.
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable { backend: "cache" })
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.entries
            .insert(
                key.to_string(),
                CacheEntry::new(value.to_string(), Instant::now(), ttl),
            )
            .await;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .await
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let now = Instant::now();
        let entry = self.entries.remove(key).await;
        Ok(entry
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let result = self
            .entries
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().is_live(now) => Op::Nop,
                    _ => Op::Put(CacheEntry::new(value.to_string(), now, ttl)),
                };
                std::future::ready(op)
            })
            .await;
        Ok(matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        ))
    }

    async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<u64> {
        self.check()?;
        let now = Instant::now();
        let result = self
            .entries
            .entry(key.to_string())
            .and_compute_with(|current| {
                let next = match current {
                    Some(entry) if entry.value().is_live(now) => {
                        let entry = entry.into_value();
                        let count = entry.value.parse::<u64>().unwrap_or(0).saturating_add(1);
                        CacheEntry {
                            value: count.to_string(),
                            time_to_live: entry.expires_at.saturating_duration_since(now),
                            expires_at: entry.expires_at,
                        }
                    }
                    _ => CacheEntry::new("1".to_string(), now, window),
                };
                std::future::ready(Op::Put(next))
            })
            .await;
        let count = match result {
            CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => {
                entry.into_value().value.parse::<u64>().unwrap_or(1)
            }
            _ => 1,
        };
        Ok(count)
    }
}

#[derive(Default)]
struct DurableState {
    refresh_tokens: HashMap<String, RefreshToken>,
    blacklist: HashMap<String, RevocationEntry>,
    sessions: HashMap<Uuid, Session>,
    users: HashMap<Uuid, User>,
    password_hashes: HashMap<Uuid, String>,
    applications: HashMap<Uuid, Application>,
}

/// In-memory durable store implementing every durable trait.
pub struct MemoryStore {
    state: Mutex<DurableState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DurableState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn insert_user(&self, user: User) {
        self.state.lock().await.users.insert(user.id, user);
    }

    pub async fn remove_user(&self, user_id: Uuid) {
        self.state.lock().await.users.remove(&user_id);
    }

    pub async fn insert_application(&self, application: Application) {
        self.state
            .lock()
            .await
            .applications
            .insert(application.id, application);
    }

    pub async fn password_hash(&self, user_id: Uuid) -> Option<String> {
        self.state.lock().await.password_hashes.get(&user_id).cloned()
    }

    /// Every refresh token ever stored for a user, revoked ones included.
    pub async fn refresh_tokens_for_user(&self, user_id: Uuid) -> Vec<RefreshToken> {
        self.state
            .lock()
            .await
            .refresh_tokens
            .values()
            .filter(|token| token.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn blacklist_len(&self) -> usize {
        self.state.lock().await.blacklist.len()
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable { backend: "durable" })
        }
    }
}

fn revoke_in_place(token: &mut RefreshToken, now: DateTime<Utc>) -> bool {
    if token.revoked_at.is_some() {
        return false;
    }
    token.revoked_at = Some(now);
    true
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn create_refresh_token(&self, token: &RefreshToken) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.refresh_tokens.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("refresh token hash"));
        }
        state
            .refresh_tokens
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn refresh_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        self.check()?;
        Ok(self.state.lock().await.refresh_tokens.get(token_hash).cloned())
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        Ok(state
            .refresh_tokens
            .get_mut(token_hash)
            .is_some_and(|token| revoke_in_place(token, Utc::now())))
    }

    async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        successor: &RefreshToken,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.refresh_tokens.contains_key(&successor.token_hash) {
            return Err(StoreError::Conflict("refresh token hash"));
        }
        let revoked = state
            .refresh_tokens
            .get_mut(old_hash)
            .is_some_and(|token| revoke_in_place(token, Utc::now()));
        if revoked {
            state
                .refresh_tokens
                .insert(successor.token_hash.clone(), successor.clone());
        }
        Ok(revoked)
    }

    async fn revoke_all_user_tokens(&self, user_id: Uuid) -> StoreResult<u64> {
        self.check()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut revoked = 0;
        for token in state.refresh_tokens.values_mut() {
            if token.user_id == user_id && revoke_in_place(token, now) {
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

#[async_trait]
impl RevocationRepository for MemoryStore {
    async fn add_to_blacklist(&self, entry: &RevocationEntry) -> StoreResult<()> {
        self.check()?;
        // Same hash twice keeps the later expiry, like the unique-constraint upsert.
        let mut state = self.state.lock().await;
        let slot = state
            .blacklist
            .entry(entry.token_hash.clone())
            .or_insert_with(|| entry.clone());
        if entry.expires_at > slot.expires_at {
            *slot = entry.clone();
        }
        Ok(())
    }

    async fn is_blacklisted(&self, token_hash: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .await
            .blacklist
            .get(token_hash)
            .is_some_and(|entry| entry.expires_at > now))
    }

    async fn active_blacklist_entries(&self) -> StoreResult<Vec<RevocationEntry>> {
        self.check()?;
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .await
            .blacklist
            .values()
            .filter(|entry| entry.expires_at > now)
            .cloned()
            .collect())
    }

    async fn purge_expired_blacklist(&self) -> StoreResult<u64> {
        self.check()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let before = state.blacklist.len();
        state.blacklist.retain(|_, entry| entry.expires_at > now);
        Ok((before - state.blacklist.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.check()?;
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .values()
            .find(|session| session.token_hash == token_hash && session.revoked_at.is_none())
            .cloned())
    }

    async fn session_by_id(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        self.check()?;
        Ok(self.state.lock().await.sessions.get(&session_id).cloned())
    }

    async fn revoke_session(&self, session_id: Uuid) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.revoked_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn revoke_user_sessions(&self, user_id: Uuid) -> StoreResult<u64> {
        self.check()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut revoked = 0;
        for session in state.sessions.values_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn refresh_session_tokens(
        &self,
        old_token_hash: &str,
        new_token_hash: &str,
        new_access_token_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(session) = state
            .sessions
            .values_mut()
            .find(|session| session.token_hash == old_token_hash && session.revoked_at.is_none())
        else {
            return Ok(false);
        };
        session.token_hash = new_token_hash.to_string();
        session.access_token_hash = Some(new_access_token_hash.to_string());
        session.expires_at = new_expires_at;
        session.last_active_at = Utc::now();
        Ok(true)
    }

    async fn user_sessions(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        self.check()?;
        let now = Utc::now();
        let mut sessions: Vec<Session> = self
            .state
            .lock()
            .await
            .sessions
            .values()
            .filter(|session| session.user_id == user_id && session.is_active_at(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(sessions)
    }

    async fn delete_expired_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.check()?;
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, session| {
            let revoked_before_cutoff = session.revoked_at.is_some_and(|at| at < cutoff);
            !(session.expires_at < cutoff || revoked_before_cutoff)
        });
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        self.check()?;
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn update_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&user_id) {
            return Ok(false);
        }
        state
            .password_hashes
            .insert(user_id, password_hash.to_string());
        Ok(true)
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn application_by_id(&self, app_id: Uuid) -> StoreResult<Option<Application>> {
        self.check()?;
        Ok(self.state.lock().await.applications.get(&app_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::Duration as ChronoDuration;

    fn refresh_token(user_id: Uuid, hash: &str) -> RefreshToken {
        let now = Utc::now();
        RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            app_id: None,
            token_hash: hash.to_string(),
            device_type: "desktop".to_string(),
            os: "Linux".to_string(),
            browser: "Firefox".to_string(),
            ip_address: "127.0.0.1".to_string(),
            session_name: "Firefox on Linux".to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::days(7),
            revoked_at: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_after_ttl() -> Result<()> {
        let cache = MemoryCache::new();
        cache.set("key", "value", Duration::from_secs(30)).await?;
        assert_eq!(cache.get("key").await?, Some("value".to_string()));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get("key").await?, None);
        assert!(!cache.exists("key").await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_without_being_read() -> Result<()> {
        let cache = MemoryCache::new();
        for index in 0..100 {
            cache
                .set(&format!("blacklist:{index}"), "1", Duration::from_millis(50))
                .await?;
            cache
                .set(&format!("token_exchange:{index}"), "{}", Duration::from_millis(80))
                .await?;
        }
        cache
            .set("blacklist:long-lived", "1", Duration::from_secs(900))
            .await?;
        assert_eq!(cache.entry_count().await, 201);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.entry_count().await, 1);
        assert!(cache.exists("blacklist:long-lived").await?);
        Ok(())
    }

    #[tokio::test]
    async fn capacity_bounds_the_number_of_keys() -> Result<()> {
        let cache = MemoryCache::with_max_capacity(50);
        for index in 0..200 {
            cache
                .set(&format!("key:{index}"), "v", Duration::from_secs(900))
                .await?;
        }
        assert!(cache.entry_count().await <= 50);
        Ok(())
    }

    #[tokio::test]
    async fn flush_drops_every_entry() -> Result<()> {
        let cache = MemoryCache::new();
        cache.set("a", "1", Duration::from_secs(60)).await?;
        cache.increment_window("rate", Duration::from_secs(60)).await?;
        cache.flush().await;
        assert_eq!(cache.entry_count().await, 0);
        assert_eq!(cache.get("a").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn take_returns_value_once() -> Result<()> {
        let cache = MemoryCache::new();
        cache.set("code", "payload", Duration::from_secs(30)).await?;
        assert_eq!(cache.take("code").await?, Some("payload".to_string()));
        assert_eq!(cache.take("code").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn set_nx_only_sets_absent_keys() -> Result<()> {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("lock", "a", Duration::from_secs(5)).await?);
        assert!(!cache.set_nx("lock", "b", Duration::from_secs(5)).await?);
        assert_eq!(cache.get("lock").await?, Some("a".to_string()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn increment_window_resets_after_window() -> Result<()> {
        let cache = MemoryCache::new();
        let window = Duration::from_secs(60);
        assert_eq!(cache.increment_window("rate", window).await?, 1);
        assert_eq!(cache.increment_window("rate", window).await?, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.increment_window("rate", window).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_cache_fails_every_call() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        assert!(matches!(
            cache.exists("key").await,
            Err(StoreError::Unavailable { backend: "cache" })
        ));
        assert!(cache.set("key", "v", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn rotate_revokes_old_and_inserts_successor() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .create_refresh_token(&refresh_token(user_id, "old"))
            .await?;

        assert!(
            store
                .rotate_refresh_token("old", &refresh_token(user_id, "new"))
                .await?
        );
        let old = store.refresh_token_by_hash("old").await?;
        assert!(old.is_some_and(|token| token.is_revoked()));
        assert!(store.refresh_token_by_hash("new").await?.is_some());

        // A second rotation of the same predecessor is refused and inserts nothing.
        assert!(
            !store
                .rotate_refresh_token("old", &refresh_token(user_id, "other"))
                .await?
        );
        assert!(store.refresh_token_by_hash("other").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_user_tokens_skips_other_users() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        store.create_refresh_token(&refresh_token(user_id, "a")).await?;
        store.create_refresh_token(&refresh_token(user_id, "b")).await?;
        store.create_refresh_token(&refresh_token(other, "c")).await?;

        assert_eq!(store.revoke_all_user_tokens(user_id).await?, 2);
        assert_eq!(store.revoke_all_user_tokens(user_id).await?, 0);
        let untouched = store.refresh_token_by_hash("c").await?;
        assert!(untouched.is_some_and(|token| !token.is_revoked()));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_refresh_token_hash_conflicts() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store.create_refresh_token(&refresh_token(user_id, "a")).await?;
        let result = store.create_refresh_token(&refresh_token(user_id, "a")).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        Ok(())
    }

    #[tokio::test]
    async fn purge_drops_only_expired_blacklist_rows() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .add_to_blacklist(&RevocationEntry {
                token_hash: "expired".to_string(),
                user_id: None,
                expires_at: now - ChronoDuration::seconds(5),
            })
            .await?;
        store
            .add_to_blacklist(&RevocationEntry {
                token_hash: "live".to_string(),
                user_id: None,
                expires_at: now + ChronoDuration::seconds(60),
            })
            .await?;

        assert!(!store.is_blacklisted("expired").await?);
        assert_eq!(store.active_blacklist_entries().await?.len(), 1);
        assert_eq!(store.purge_expired_blacklist().await?, 1);
        assert_eq!(store.blacklist_len().await, 1);
        Ok(())
    }
}
