//! Validation cache with TTL
//!
//! Remembers tokens that passed the full verification chain so repeated
//! requests skip cryptography and remote calls. Entries are keyed by the full
//! [`TokenDigest`] of the raw token; secondary indices by [`Fingerprint`] and
//! user id make invalidation after a revocation O(1).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::Result;
use crate::token::{Fingerprint, TokenDigest, VerifiedToken, now_secs};

/// Cache of successful verifications.
#[async_trait]
pub trait ValidationCache: Send + Sync + 'static {
    /// Cached verification for `digest`, if still fresh.
    async fn lookup(&self, digest: &TokenDigest) -> Result<Option<VerifiedToken>>;

    /// Remember a verification for at most `ttl`, never past the token's expiry.
    async fn put(&self, digest: TokenDigest, verified: VerifiedToken, ttl: Duration) -> Result<()>;

    /// Drop every entry for the token with `fingerprint`.
    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Drop every entry for `user_id`.
    async fn invalidate_user(&self, user_id: &str) -> Result<()>;

    /// Remove expired entries. Called periodically by the background reaper.
    async fn reap_expired(&self) -> usize;
}

struct CachedValidation {
    verified: VerifiedToken,
    expires: Instant,
}

impl CachedValidation {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: AtomicU64,
    /// Lookups that fell through to verification
    pub misses: AtomicU64,
    /// Entries removed by expiry or invalidation
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Get current cache hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get current cache miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Bounded in-memory validation cache
///
/// `max_entries` is a hard bound: a slot is reserved before an entry is
/// inserted and released whenever one is removed.
pub struct InMemoryValidationCache {
    entries: DashMap<TokenDigest, CachedValidation>,
    by_fingerprint: DashMap<Fingerprint, Vec<TokenDigest>>,
    by_user: DashMap<String, Vec<TokenDigest>>,
    max_entries: usize,
    occupied: AtomicUsize,
    stats: CacheStats,
}

impl InMemoryValidationCache {
    /// Create a cache holding at most `max_entries`
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            by_fingerprint: DashMap::new(),
            by_user: DashMap::new(),
            max_entries,
            occupied: AtomicUsize::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of entries (expired entries not yet reaped included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn try_reserve(&self) -> bool {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_entries).then_some(n + 1)
            })
            .is_ok()
    }

    fn reserve_slot(&self) -> bool {
        self.try_reserve() || (self.evict_expired() > 0 && self.try_reserve())
    }

    fn release(&self, count: usize) {
        self.occupied.fetch_sub(count, Ordering::AcqRel);
        self.stats
            .evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn index(&self, digest: &TokenDigest, verified: &VerifiedToken) {
        self.by_fingerprint
            .entry(verified.fingerprint.clone())
            .or_default()
            .push(digest.clone());
        self.by_user
            .entry(verified.identity.user_id.clone())
            .or_default()
            .push(digest.clone());
    }

    fn unindex(&self, digest: &TokenDigest, verified: &VerifiedToken) {
        drop_from(&self.by_fingerprint, &verified.fingerprint, digest);
        drop_from(&self.by_user, &verified.identity.user_id, digest);
    }

    fn evict_expired(&self) -> usize {
        let mut expired = Vec::new();
        self.entries.retain(|digest, entry| {
            if entry.is_expired() {
                expired.push((digest.clone(), entry.verified.clone()));
                false
            } else {
                true
            }
        });
        for (digest, verified) in &expired {
            self.unindex(digest, verified);
        }
        if !expired.is_empty() {
            self.release(expired.len());
        }
        expired.len()
    }

    fn remove_all(&self, digests: Vec<TokenDigest>) {
        for digest in digests {
            if let Some((digest, entry)) = self.entries.remove(&digest) {
                self.unindex(&digest, &entry.verified);
                self.release(1);
            }
        }
    }
}

fn drop_from<K>(index: &DashMap<K, Vec<TokenDigest>>, key: &K, digest: &TokenDigest)
where
    K: Eq + std::hash::Hash,
{
    if let Some(mut digests) = index.get_mut(key) {
        digests.retain(|d| d != digest);
    }
    index.remove_if(key, |_, digests| digests.is_empty());
}

#[async_trait]
impl ValidationCache for InMemoryValidationCache {
    async fn lookup(&self, digest: &TokenDigest) -> Result<Option<VerifiedToken>> {
        let hit = self
            .entries
            .get(digest)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.verified.clone());
        if let Some(verified) = hit {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(verified));
        }

        if let Some((digest, entry)) = self.entries.remove_if(digest, |_, e| e.is_expired()) {
            self.unindex(&digest, &entry.verified);
            self.release(1);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, digest: TokenDigest, verified: VerifiedToken, ttl: Duration) -> Result<()> {
        let ttl = ttl.min(verified.remaining(now_secs()));
        if ttl.is_zero() {
            return Ok(());
        }

        let entry = CachedValidation {
            verified: verified.clone(),
            expires: Instant::now() + ttl,
        };

        if let Some(mut existing) = self.entries.get_mut(&digest) {
            // same raw token, so the same fingerprint and user
            *existing = entry;
            return Ok(());
        }

        if !self.reserve_slot() {
            debug!(max_entries = self.max_entries, "Validation cache full, not caching");
            return Ok(());
        }
        self.index(&digest, &verified);
        if self.entries.insert(digest, entry).is_some() {
            // a concurrent put of the same token already holds a slot
            self.occupied.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()> {
        if let Some((_, digests)) = self.by_fingerprint.remove(fingerprint) {
            self.remove_all(digests);
            debug!(fingerprint = %fingerprint, "Invalidated cached validation");
        }
        Ok(())
    }

    async fn invalidate_user(&self, user_id: &str) -> Result<()> {
        if let Some((_, digests)) = self.by_user.remove(user_id) {
            self.remove_all(digests);
            debug!(user_id = %user_id, "Invalidated cached validations for user");
        }
        Ok(())
    }

    async fn reap_expired(&self) -> usize {
        self.evict_expired()
    }
}

/// Cache used when caching is disabled: every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledValidationCache;

#[async_trait]
impl ValidationCache for DisabledValidationCache {
    async fn lookup(&self, _digest: &TokenDigest) -> Result<Option<VerifiedToken>> {
        Ok(None)
    }

    async fn put(&self, _digest: TokenDigest, _verified: VerifiedToken, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn invalidate(&self, _fingerprint: &Fingerprint) -> Result<()> {
        Ok(())
    }

    async fn invalidate_user(&self, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn reap_expired(&self) -> usize {
        0
    }
}

/// Spawn a background task that reaps expired cache entries every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    cache: Arc<dyn ValidationCache>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = cache.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired cached validations");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Validation cache reaper shutting down");
                    break;
                }
            }
        }
    });
}
