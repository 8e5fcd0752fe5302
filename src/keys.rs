//! Trusted verification keys fetched from a JWKS endpoint

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tracing::{debug, info, warn};
use url::Url;

use crate::failsafe::{CircuitBreaker, RefreshThrottle};
use crate::{Error, Result};

const RSA_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// Where key sets come from
#[async_trait]
pub trait JwksSource: Send + Sync {
    /// Fetch the current key set
    async fn fetch(&self) -> Result<JwkSet>;
}

/// JWKS document served over HTTP
pub struct HttpJwksSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpJwksSource {
    /// Source reading `url` with `client`
    #[must_use]
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<JwkSet> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<JwkSet>().await?)
    }
}

/// A trusted public key
pub struct VerificationKey {
    /// `kid`
    pub key_id: String,
    /// Algorithms the key may verify
    pub algorithms: Vec<Algorithm>,
    /// Key material
    pub decoding_key: DecodingKey,
    /// When the key was fetched
    pub cached_at: Instant,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("key_id", &self.key_id)
            .field("algorithms", &self.algorithms)
            .field("cached_at", &self.cached_at)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Convert a JWK, skipping anything that is not an RSA signing key with a `kid`
    #[must_use]
    pub fn from_jwk(jwk: &Jwk, now: Instant) -> Option<Self> {
        let kid = jwk.common.key_id.clone()?;
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }
        let AlgorithmParameters::RSA(rsa) = &jwk.algorithm else {
            return None;
        };

        let algorithms = match jwk.common.key_algorithm {
            None => RSA_ALGORITHMS.to_vec(),
            Some(KeyAlgorithm::RS256) => vec![Algorithm::RS256],
            Some(KeyAlgorithm::RS384) => vec![Algorithm::RS384],
            Some(KeyAlgorithm::RS512) => vec![Algorithm::RS512],
            Some(KeyAlgorithm::PS256) => vec![Algorithm::PS256],
            Some(KeyAlgorithm::PS384) => vec![Algorithm::PS384],
            Some(KeyAlgorithm::PS512) => vec![Algorithm::PS512],
            Some(other) => {
                debug!(kid = %kid, alg = ?other, "Skipping JWK with non-signing algorithm");
                return None;
            }
        };

        match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
            Ok(decoding_key) => Some(Self {
                key_id: kid,
                algorithms,
                decoding_key,
                cached_at: now,
            }),
            Err(e) => {
                warn!(kid = %kid, error = %e, "Skipping JWK with invalid RSA components");
                None
            }
        }
    }
}

/// Cache of trusted keys keyed by `kid`
pub struct KeyStore {
    source: Arc<dyn JwksSource>,
    keys: DashMap<String, Arc<VerificationKey>>,
    ttl: Duration,
    breaker: Arc<CircuitBreaker>,
    throttle: RefreshThrottle,
}

impl KeyStore {
    /// Create an empty store
    #[must_use]
    pub fn new(
        source: Arc<dyn JwksSource>,
        ttl: Duration,
        breaker: Arc<CircuitBreaker>,
        throttle: RefreshThrottle,
    ) -> Self {
        Self {
            source,
            keys: DashMap::new(),
            ttl,
            breaker,
            throttle,
        }
    }

    /// Resolve `kid`, refreshing once on a miss.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<VerificationKey>> {
        if let Some(key) = self.cached(kid) {
            return Ok(key);
        }

        if !self.throttle.try_acquire() {
            debug!(kid = %kid, "Key miss, forced refresh throttled");
            return Err(Error::KeyNotFound(kid.to_string()));
        }

        debug!(kid = %kid, "Key miss, forcing refresh");
        if let Err(e) = self.refresh_all().await
            && e.is_dependency_failure()
        {
            // cached keys stay usable, but this kid is still unknown
            return Err(match e {
                Error::ServiceUnavailable(msg) => Error::ServiceUnavailable(msg),
                other => Error::ServiceUnavailable(other.to_string()),
            });
        }

        self.cached(kid)
            .ok_or_else(|| Error::KeyNotFound(kid.to_string()))
    }

    /// Replace the key set with a fresh fetch.
    ///
    /// On failure the current keys are kept. Returns the number of keys loaded.
    pub async fn refresh_all(&self) -> Result<usize> {
        let set = match self.breaker.call(self.source.fetch()).await {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, retained = self.keys.len(), "KeyRefreshFailed");
                return Err(e);
            }
        };

        let now = Instant::now();
        let fresh: Vec<VerificationKey> = set
            .keys
            .iter()
            .filter_map(|jwk| VerificationKey::from_jwk(jwk, now))
            .collect();

        self.keys
            .retain(|kid, _| fresh.iter().any(|k| &k.key_id == kid));
        let count = fresh.len();
        for key in fresh {
            self.keys.insert(key.key_id.clone(), Arc::new(key));
        }

        info!(keys = count, "Refreshed verification keys");
        Ok(count)
    }

    /// Drop a key
    pub fn invalidate(&self, kid: &str) {
        self.keys.remove(kid);
    }

    /// Number of cached keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn cached(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys
            .get(kid)
            .filter(|key| key.cached_at.elapsed() < self.ttl)
            .map(|key| Arc::clone(key.value()))
    }
}

/// Spawn a background task that refreshes `store` every `interval`.
///
/// Failures are logged by [`KeyStore::refresh_all`] and otherwise ignored.
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_refresher(
    store: Arc<KeyStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = store.refresh_all().await;
                }
                _ = shutdown.recv() => {
                    debug!("Key refresher shutting down");
                    break;
                }
            }
        }
    });
}
