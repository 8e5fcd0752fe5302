//! Revocation store: the blacklist of tokens that must no longer be accepted.
//!
//! The [`RevocationStore`] trait abstracts over storage backends.
//! [`InMemoryRevocationStore`] keeps entries in `DashMap`s with lazy eviction
//! on lookup plus an optional background reaper; [`DisabledRevocationStore`]
//! is selected when revocation is turned off.
//!
//! # Design
//!
//! A token entry lives exactly as long as the token itself could have been
//! accepted, so storage stays bounded by the number of live tokens. A user
//! entry marks every token of that user issued at or before `revoked_at`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::Result;
use crate::token::Fingerprint;

/// Storage for revoked tokens and users.
#[async_trait]
pub trait RevocationStore: Send + Sync + 'static {
    /// Revoke one token for `ttl` (its remaining lifetime). A zero ttl is a no-op.
    async fn revoke(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<()>;

    /// Whether the token is revoked.
    async fn is_revoked(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Revoke every token of `user_id` issued at or before `revoked_at` (Unix seconds).
    async fn revoke_user(&self, user_id: &str, revoked_at: u64, ttl: Duration) -> Result<()>;

    /// Cut-off of the user's latest user-wide revocation, if any.
    async fn user_revoked_at(&self, user_id: &str) -> Result<Option<u64>>;

    /// Remove expired entries. Called periodically by the background reaper.
    async fn reap_expired(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct UserRevocation {
    revoked_at: u64,
    expires: Instant,
}

/// In-memory revocation store
#[derive(Default)]
pub struct InMemoryRevocationStore {
    tokens: DashMap<Fingerprint, Instant>,
    users: DashMap<String, UserRevocation>,
}

impl InMemoryRevocationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live token entries (expired entries not yet reaped included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the store holds no token entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn revoke(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            debug!(fingerprint = %fingerprint, "Token already expired, not recording revocation");
            return Ok(());
        }
        let expires = Instant::now() + ttl;
        self.tokens
            .entry(fingerprint.clone())
            .and_modify(|current| *current = (*current).max(expires))
            .or_insert(expires);
        Ok(())
    }

    async fn is_revoked(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let Some(expires) = self.tokens.get(fingerprint).map(|e| *e.value()) else {
            return Ok(false);
        };

        if expires <= Instant::now() {
            // Lazy eviction: remove on access
            self.tokens.remove(fingerprint);
            debug!(fingerprint = %fingerprint, "Lazy-evicted expired revocation");
            return Ok(false);
        }
        Ok(true)
    }

    async fn revoke_user(&self, user_id: &str, revoked_at: u64, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let entry = UserRevocation {
            revoked_at,
            expires: Instant::now() + ttl,
        };
        self.users
            .entry(user_id.to_string())
            .and_modify(|current| {
                if revoked_at >= current.revoked_at {
                    *current = entry;
                }
            })
            .or_insert(entry);
        Ok(())
    }

    async fn user_revoked_at(&self, user_id: &str) -> Result<Option<u64>> {
        let Some(entry) = self.users.get(user_id).map(|e| *e.value()) else {
            return Ok(None);
        };

        if entry.expires <= Instant::now() {
            self.users.remove(user_id);
            return Ok(None);
        }
        Ok(Some(entry.revoked_at))
    }

    async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.tokens.len() + self.users.len();
        self.tokens.retain(|_, expires| *expires > now);
        self.users.retain(|_, entry| entry.expires > now);
        before.saturating_sub(self.tokens.len() + self.users.len())
    }
}

/// Store used when revocation is disabled: nothing is ever revoked.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRevocationStore;

#[async_trait]
impl RevocationStore for DisabledRevocationStore {
    async fn revoke(&self, _fingerprint: &Fingerprint, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn is_revoked(&self, _fingerprint: &Fingerprint) -> Result<bool> {
        Ok(false)
    }

    async fn revoke_user(&self, _user_id: &str, _revoked_at: u64, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn user_revoked_at(&self, _user_id: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    async fn reap_expired(&self) -> usize {
        0
    }
}

/// Spawn a background task that reaps expired revocations every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn RevocationStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired revocations");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Revocation reaper shutting down");
                    break;
                }
            }
        }
    });
}
