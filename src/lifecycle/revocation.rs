//! Token revocation over two independently failing backends.
//!
//! Every entry is written to the keyed-TTL cache and to the durable store. A hash is
//! revoked when *either* copy has it:
//!
//! - Reads check the cache first. A cache hit answers immediately; a healthy cache
//!   miss answers "not revoked". Only a cache *failure* falls back to the durable
//!   store, and a durable hit is written back to the cache with the access-token TTL.
//! - Writes go to both backends and fail only when both fail.
//! - [`RevocationStore::sync_from_durable`] copies every live durable entry missing
//!   from the cache with its actual remaining lifetime; it runs at startup.
//!
//! When both backends are unreachable on a read the answer is "not revoked".

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec::TokenCodec;
use super::error::{Error, Result};
use crate::store::{CacheBackend, RevocationEntry, RevocationRepository, Session};

const CACHE_KEY_PREFIX: &str = "blacklist:";

#[must_use]
pub fn cache_key(token_hash: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{token_hash}")
}

/// Outcome of one [`RevocationStore::sync_from_durable`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub total_entries: usize,
    pub synced: u64,
    pub errors: u64,
}

/// Counters for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RevocationStats {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub total_synced: u64,
    pub sync_errors: u64,
    pub cache_errors: u64,
    pub durable_errors: u64,
    pub cache_repairs: u64,
}

#[derive(Default)]
struct Counters {
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    total_synced: AtomicU64,
    sync_errors: AtomicU64,
    cache_errors: AtomicU64,
    durable_errors: AtomicU64,
    cache_repairs: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct RevocationStore {
    cache: Arc<dyn CacheBackend>,
    durable: Arc<dyn RevocationRepository>,
    codec: Arc<dyn TokenCodec>,
    counters: Counters,
}

impl RevocationStore {
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        durable: Arc<dyn RevocationRepository>,
        codec: Arc<dyn TokenCodec>,
    ) -> Self {
        Self {
            cache,
            durable,
            codec,
            counters: Counters::default(),
        }
    }

    /// Whether `token_hash` is currently revoked. Never fails; see the module docs
    /// for the fallback order.
    pub async fn is_blacklisted(&self, token_hash: &str) -> bool {
        let key = cache_key(token_hash);
        let cache_err = match self.cache.exists(&key).await {
            Ok(true) => return true,
            Ok(false) => return false,
            Err(err) => err,
        };

        bump(&self.counters.cache_errors);
        warn!("blacklist cache check failed, falling back to durable store: {cache_err}");

        match self.durable.is_blacklisted(token_hash).await {
            Ok(true) => {
                // Repair uses the access-token TTL, not the entry's remaining lifetime.
                let ttl = self.codec.access_token_ttl();
                match self.cache.set(&key, "1", ttl).await {
                    Ok(()) => bump(&self.counters.cache_repairs),
                    Err(err) => {
                        bump(&self.counters.cache_errors);
                        warn!("failed to restore blacklist entry to cache: {err}");
                    }
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                bump(&self.counters.durable_errors);
                error!("blacklist check failed on both backends: {err}");
                false
            }
        }
    }

    /// Revoke `token_hash` for `ttl`. A zero TTL is a no-op.
    ///
    /// An `Ok` return does not mean both writes landed; one surviving copy is enough.
    ///
    /// # Errors
    /// [`Error::StorageUnavailable`] only when both backends rejected the write.
    pub async fn add(&self, token_hash: &str, user_id: Option<Uuid>, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }

        let value = user_id.map_or_else(|| "1".to_string(), |id| id.to_string());
        let cache_result = self.cache.set(&cache_key(token_hash), &value, ttl).await;
        if let Err(err) = &cache_result {
            bump(&self.counters.cache_errors);
            error!("failed to add token to cache blacklist: {err}");
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|err| Error::Validation(err.to_string()))?;
        let entry = RevocationEntry {
            token_hash: token_hash.to_string(),
            user_id,
            expires_at,
        };
        let durable_result = self.durable.add_to_blacklist(&entry).await;
        if let Err(err) = &durable_result {
            bump(&self.counters.durable_errors);
            error!("failed to add token to durable blacklist: {err}");
        }

        if cache_result.is_err() && durable_result.is_err() {
            return Err(Error::StorageUnavailable);
        }
        debug!(ttl_seconds = ttl.as_secs(), "token added to blacklist");
        Ok(())
    }

    /// # Errors
    /// As [`RevocationStore::add`].
    pub async fn add_access_token(&self, token_hash: &str, user_id: Option<Uuid>) -> Result<()> {
        self.add(token_hash, user_id, self.codec.access_token_ttl())
            .await
    }

    /// # Errors
    /// As [`RevocationStore::add`].
    pub async fn add_refresh_token(&self, token_hash: &str, user_id: Option<Uuid>) -> Result<()> {
        self.add(token_hash, user_id, self.codec.refresh_token_ttl())
            .await
    }

    /// Revoke both hashes a session carries.
    ///
    /// # Errors
    /// The last failure, when either hash could not be written to any backend.
    pub async fn blacklist_session_tokens(&self, session: &Session) -> Result<()> {
        let mut last_err = None;
        let access_hash = session
            .access_token_hash
            .as_deref()
            .filter(|hash| !hash.is_empty());

        if access_hash.is_none() && session.token_hash.is_empty() {
            warn!(session_id = %session.id, "session has no tokens to blacklist");
        }

        if let Some(access_hash) = access_hash {
            match self.add_access_token(access_hash, Some(session.user_id)).await {
                Ok(()) => info!(session_id = %session.id, "access token blacklisted"),
                Err(err) => {
                    error!(session_id = %session.id, "failed to blacklist access token: {err}");
                    last_err = Some(err);
                }
            }
        }

        if !session.token_hash.is_empty() {
            match self
                .add_refresh_token(&session.token_hash, Some(session.user_id))
                .await
            {
                Ok(()) => info!(session_id = %session.id, "refresh token blacklisted"),
                Err(err) => {
                    error!(session_id = %session.id, "failed to blacklist refresh token: {err}");
                    last_err = Some(err);
                }
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Copy live durable entries missing from the cache, with their remaining TTL.
    ///
    /// # Errors
    /// Fails when the durable entries cannot be listed. Per-entry cache failures are
    /// counted and skipped.
    pub async fn sync_from_durable(&self) -> Result<SyncReport> {
        info!("starting blacklist synchronization from durable store to cache");

        let entries = match self.durable.active_blacklist_entries().await {
            Ok(entries) => entries,
            Err(err) => {
                bump(&self.counters.durable_errors);
                error!("failed to load blacklist entries from durable store: {err}");
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let mut report = SyncReport {
            total_entries: entries.len(),
            ..SyncReport::default()
        };

        for entry in &entries {
            let Some(ttl) = entry.remaining_ttl(now) else {
                continue;
            };
            let key = cache_key(&entry.token_hash);

            match self.cache.exists(&key).await {
                Ok(true) => {}
                Ok(false) => {
                    let value = entry
                        .user_id
                        .map_or_else(|| "1".to_string(), |id| id.to_string());
                    if let Err(err) = self.cache.set(&key, &value, ttl).await {
                        bump(&self.counters.cache_errors);
                        report.errors += 1;
                        warn!("failed to sync blacklist entry to cache: {err}");
                        continue;
                    }
                    report.synced += 1;
                }
                Err(err) => {
                    bump(&self.counters.cache_errors);
                    report.errors += 1;
                    warn!("failed to check cache during blacklist sync: {err}");
                }
            }
        }

        *self.counters.last_sync_at.lock().await = Some(Utc::now());
        self.counters
            .total_synced
            .fetch_add(report.synced, Ordering::Relaxed);
        self.counters
            .sync_errors
            .fetch_add(report.errors, Ordering::Relaxed);

        info!(
            total_entries = report.total_entries,
            synced = report.synced,
            errors = report.errors,
            "blacklist synchronization completed"
        );
        Ok(report)
    }

    /// Delete durable entries past their expiry. The cache expires on its own.
    ///
    /// # Errors
    /// Propagates the durable store failure.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.durable.purge_expired_blacklist().await.map_err(|err| {
            bump(&self.counters.durable_errors);
            Error::from(err)
        })?;
        debug!(purged, "purged expired blacklist entries");
        Ok(purged)
    }

    pub async fn stats(&self) -> RevocationStats {
        RevocationStats {
            last_sync_at: *self.counters.last_sync_at.lock().await,
            total_synced: self.counters.total_synced.load(Ordering::Relaxed),
            sync_errors: self.counters.sync_errors.load(Ordering::Relaxed),
            cache_errors: self.counters.cache_errors.load(Ordering::Relaxed),
            durable_errors: self.counters.durable_errors.load(Ordering::Relaxed),
            cache_repairs: self.counters.cache_repairs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::codec::JwtCodec;
    use crate::store::{MemoryCache, MemoryStore, StoreError, StoreResult};
    use anyhow::Result;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::atomic::AtomicBool;

    const ACCESS_TTL: Duration = Duration::from_secs(900);

    /// Cache whose reads can fail while writes keep working.
    #[derive(Default)]
    struct ReadFailingCache {
        inner: MemoryCache,
        fail_reads: AtomicBool,
    }

    impl ReadFailingCache {
        fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        fn read_check(&self) -> StoreResult<()> {
            if self.fail_reads.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable { backend: "cache" })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheBackend for ReadFailingCache {
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.read_check()?;
            self.inner.get(key).await
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.read_check()?;
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await
        }

        async fn take(&self, key: &str) -> StoreResult<Option<String>> {
            self.read_check()?;
            self.inner.take(key).await
        }

        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.set_nx(key, value, ttl).await
        }

        async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<u64> {
            self.inner.increment_window(key, window).await
        }
    }

    fn codec() -> Arc<dyn TokenCodec> {
        Arc::new(JwtCodec::new(
            &SecretString::from("test-secret".to_string()),
            "tokengate",
            ACCESS_TTL,
            Duration::from_secs(604_800),
        ))
    }

    fn store(
        cache: Arc<dyn CacheBackend>,
        durable: Arc<MemoryStore>,
    ) -> RevocationStore {
        RevocationStore::new(cache, durable, codec())
    }

    #[tokio::test]
    async fn add_writes_both_backends() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());

        revocations
            .add("hash", Some(Uuid::new_v4()), Duration::from_secs(60))
            .await?;

        assert!(cache.exists(&cache_key("hash")).await?);
        assert!(durable.is_blacklisted("hash").await?);
        assert!(revocations.is_blacklisted("hash").await);
        assert!(!revocations.is_blacklisted("other").await);
        Ok(())
    }

    #[tokio::test]
    async fn zero_ttl_is_a_noop() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());

        revocations.add("hash", None, Duration::ZERO).await?;
        assert!(!revocations.is_blacklisted("hash").await);
        assert_eq!(durable.blacklist_len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn single_backend_failure_is_absorbed() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());

        cache.set_available(false);
        revocations.add("durable-only", None, ACCESS_TTL).await?;
        cache.set_available(true);
        durable.set_available(false);
        revocations.add("cache-only", None, ACCESS_TTL).await?;
        durable.set_available(true);

        assert!(durable.is_blacklisted("durable-only").await?);
        assert!(revocations.is_blacklisted("cache-only").await);

        let stats = revocations.stats().await;
        assert_eq!(stats.cache_errors, 1);
        assert_eq!(stats.durable_errors, 1);
        Ok(())
    }

    #[tokio::test]
    async fn both_backends_failing_surfaces_storage_unavailable() {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());
        cache.set_available(false);
        durable.set_available(false);

        assert!(matches!(
            revocations.add("hash", None, ACCESS_TTL).await,
            Err(Error::StorageUnavailable)
        ));
        // Reads fail open.
        assert!(!revocations.is_blacklisted("hash").await);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_failure_falls_back_to_durable_and_repairs() -> Result<()> {
        let cache = Arc::new(ReadFailingCache::default());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());

        revocations
            .add("hash", None, Duration::from_secs(604_800))
            .await?;
        // Lost out of band, then the cache starts failing reads.
        cache.inner.flush().await;
        cache.fail_reads(true);

        assert!(revocations.is_blacklisted("hash").await);

        cache.fail_reads(false);
        assert!(cache.exists(&cache_key("hash")).await?);
        assert_eq!(revocations.stats().await.cache_repairs, 1);

        // The repaired copy lives for the access-token TTL, not the original week.
        tokio::time::advance(ACCESS_TTL + Duration::from_secs(1)).await;
        assert!(!cache.exists(&cache_key("hash")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn healthy_cache_miss_does_not_consult_durable() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());

        revocations.add("hash", None, ACCESS_TTL).await?;
        cache.flush().await;
        assert!(!revocations.is_blacklisted("hash").await);

        // Sync heals the out-of-band loss.
        let report = revocations.sync_from_durable().await?;
        assert_eq!(report.synced, 1);
        assert!(revocations.is_blacklisted("hash").await);
        Ok(())
    }

    #[tokio::test]
    async fn sync_skips_expired_and_present_entries() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());
        let now = Utc::now();

        durable
            .add_to_blacklist(&RevocationEntry {
                token_hash: "expired".to_string(),
                user_id: None,
                expires_at: now - chrono::Duration::seconds(10),
            })
            .await?;
        durable
            .add_to_blacklist(&RevocationEntry {
                token_hash: "live".to_string(),
                user_id: Some(Uuid::new_v4()),
                expires_at: now + chrono::Duration::seconds(120),
            })
            .await?;
        revocations.add("cached", None, ACCESS_TTL).await?;

        let report = revocations.sync_from_durable().await?;
        assert_eq!(report.total_entries, 2);
        assert_eq!(report.synced, 1);
        assert_eq!(report.errors, 0);
        assert!(!cache.exists(&cache_key("expired")).await?);
        assert!(cache.exists(&cache_key("live")).await?);

        let stats = revocations.stats().await;
        assert!(stats.last_sync_at.is_some());
        assert_eq!(stats.total_synced, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sync_uses_remaining_ttl() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());

        durable
            .add_to_blacklist(&RevocationEntry {
                token_hash: "short".to_string(),
                user_id: None,
                expires_at: Utc::now() + chrono::Duration::seconds(30),
            })
            .await?;
        revocations.sync_from_durable().await?;
        assert!(cache.exists(&cache_key("short")).await?);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!cache.exists(&cache_key("short")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn sync_counts_cache_errors_and_fails_without_durable() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());
        revocations.add("hash", None, ACCESS_TTL).await?;

        cache.set_available(false);
        let report = revocations.sync_from_durable().await?;
        assert_eq!(report.errors, 1);
        assert_eq!(revocations.stats().await.sync_errors, 1);

        durable.set_available(false);
        assert!(revocations.sync_from_durable().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn session_tokens_are_both_blacklisted() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache.clone(), durable.clone());
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            app_id: None,
            token_hash: "refresh-hash".to_string(),
            access_token_hash: Some("access-hash".to_string()),
            device_type: "desktop".to_string(),
            os: "Linux".to_string(),
            browser: "Firefox".to_string(),
            ip_address: "127.0.0.1".to_string(),
            user_agent: String::new(),
            session_name: "Firefox on Linux".to_string(),
            last_active_at: now,
            created_at: now,
            expires_at: now + chrono::Duration::days(7),
            revoked_at: None,
        };

        revocations.blacklist_session_tokens(&session).await?;
        assert!(revocations.is_blacklisted("refresh-hash").await);
        assert!(revocations.is_blacklisted("access-hash").await);
        Ok(())
    }

    #[tokio::test]
    async fn purge_expired_delegates_to_durable() -> Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        let revocations = store(cache, durable.clone());
        durable
            .add_to_blacklist(&RevocationEntry {
                token_hash: "old".to_string(),
                user_id: None,
                expires_at: Utc::now() - chrono::Duration::seconds(1),
            })
            .await?;

        assert_eq!(revocations.purge_expired().await?, 1);
        assert_eq!(durable.blacklist_len().await, 0);
        Ok(())
    }
}
