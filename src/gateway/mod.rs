//! Authentication gateway: the façade request handling code talks to
//!
//! [`AuthGateway`] composes the local signer, the remote verifier, the
//! revocation store, the validation cache and the rate limiter behind
//! `authenticate` / `check_rate` / `revoke`.

pub mod middleware;
mod router;
mod server;

pub use middleware::{MiddlewareState, RouteTable, auth_middleware};
pub use router::{AppState, create_router};
pub use server::Server;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audit::{self, AuditEvent};
use crate::cache::{self, DisabledValidationCache, InMemoryValidationCache, ValidationCache};
use crate::config::{Config, LockoutConfig, RateLimitConfig, RemoteMode};
use crate::failsafe::{
    self, Caller, CircuitBreakerRegistry, EndpointClass, IDENTITY_HEALTH_BREAKER,
    IDENTITY_VALIDATE_BREAKER, JWKS_BREAKER, LockoutTracker, RateDecision, RateLimiter,
    RefreshThrottle,
};
use crate::keys::{self, HttpJwksSource, KeyStore};
use crate::local::LocalSigner;
use crate::remote::{IdentityClient, IdentityHealth, IntrospectionVerifier, RemoteVerifier};
use crate::revocation::{self, DisabledRevocationStore, InMemoryRevocationStore, RevocationStore};
use crate::token::{
    Identity, IssuedToken, Subject, TokenDigest, TokenVerifier, UnverifiedToken, VerifiedToken,
    now_secs,
};
use crate::{Error, Result};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CACHE_ENTRIES: usize = 10_000;
const DEFAULT_USER_REVOCATION_TTL: Duration = Duration::from_secs(24 * 3600);

/// Authentication and trust façade
pub struct AuthGateway {
    local_issuer: String,
    signer: Option<Arc<LocalSigner>>,
    local: Option<Arc<dyn TokenVerifier>>,
    remote: Option<Arc<dyn TokenVerifier>>,
    remote_accepts_opaque: bool,
    revocation: Arc<dyn RevocationStore>,
    cache: Arc<dyn ValidationCache>,
    cache_ttl: Duration,
    user_revocation_ttl: Duration,
    rate_limiter: Arc<RateLimiter>,
    lockout: Arc<LockoutTracker>,
    breakers: Arc<CircuitBreakerRegistry>,
    key_store: Option<Arc<KeyStore>>,
    identity_client: Option<Arc<IdentityClient>>,
}

/// Health of the gateway's remote dependencies
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Breaker states
    pub circuit_breakers: Vec<BreakerStatus>,
    /// Identity service, when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_service: Option<IdentityHealth>,
}

/// One breaker in a [`HealthReport`]
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Protected call name
    pub name: String,
    /// `closed`, `open` or `half-open`
    pub state: &'static str,
    /// Human-readable status
    pub message: String,
}

impl AuthGateway {
    /// Start building a gateway with explicit components
    #[must_use]
    pub fn builder() -> AuthGatewayBuilder {
        AuthGatewayBuilder::default()
    }

    /// Build a gateway from configuration.
    ///
    /// Revocation and caching are replaced by their disabled implementations
    /// when turned off. Background tasks are started separately with
    /// [`AuthGateway::spawn_maintenance`].
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let signer = Arc::new(LocalSigner::new(&config.local)?);

        let revocation: Arc<dyn RevocationStore> = if config.revocation.enabled {
            Arc::new(InMemoryRevocationStore::new())
        } else {
            Arc::new(DisabledRevocationStore)
        };
        let cache: Arc<dyn ValidationCache> = if config.cache.enabled {
            Arc::new(InMemoryValidationCache::new(config.cache.max_entries))
        } else {
            Arc::new(DisabledValidationCache)
        };

        let mut builder = Self::builder()
            .local_signer(signer)
            .revocation_store(revocation)
            .validation_cache(cache)
            .cache_ttl(config.cache.ttl)
            .user_revocation_ttl(config.revocation.max_token_lifetime)
            .rate_limiter(Arc::new(RateLimiter::new(&config.rate_limit)))
            .lockout(Arc::new(LockoutTracker::new(&config.lockout)))
            .breakers(Arc::clone(&breakers));

        let remote = &config.remote;
        if remote.enabled || remote.identity_base_url.is_some() {
            let http = reqwest::Client::builder()
                .timeout(config.circuit_breaker.call_timeout)
                .build()?;

            if let Some(base) = &remote.identity_base_url {
                let client = Arc::new(IdentityClient::new(
                    http.clone(),
                    base,
                    breakers.get(IDENTITY_VALIDATE_BREAKER),
                    breakers.get(IDENTITY_HEALTH_BREAKER),
                )?);
                builder = builder.identity_client(client);
            }

            if remote.enabled {
                match remote.mode {
                    RemoteMode::Jwks => {
                        let url = remote.jwks_url.clone().ok_or_else(|| {
                            Error::Config("remote.jwks_url is required in jwks mode".into())
                        })?;
                        let store = Arc::new(KeyStore::new(
                            Arc::new(HttpJwksSource::new(http, url)),
                            remote.key_ttl,
                            breakers.get(JWKS_BREAKER),
                            RefreshThrottle::new(
                                remote.forced_refresh_period,
                                remote.forced_refresh_burst,
                            ),
                        ));
                        let verifier = RemoteVerifier::new(
                            Arc::clone(&store),
                            remote.issuer.clone(),
                            remote.audience.clone(),
                            remote.leeway,
                        );
                        builder = builder.key_store(store).remote_verifier(Arc::new(verifier));
                    }
                    RemoteMode::Introspection => {
                        let client = builder.identity_client.clone().ok_or_else(|| {
                            Error::Config(
                                "remote.identity_base_url is required in introspection mode".into(),
                            )
                        })?;
                        builder = builder
                            .remote_verifier(Arc::new(IntrospectionVerifier::new(
                                client,
                                config.cache.ttl,
                            )))
                            .remote_accepts_opaque(true);
                    }
                }
            }
        }

        builder.build()
    }

    /// Issuer of local tokens
    #[must_use]
    pub fn local_issuer(&self) -> &str {
        &self.local_issuer
    }

    /// Rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Failed-authentication lockout
    #[must_use]
    pub fn lockout(&self) -> &Arc<LockoutTracker> {
        &self.lockout
    }

    /// Circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// JWKS key store, in jwks mode
    #[must_use]
    pub fn key_store(&self) -> Option<&Arc<KeyStore>> {
        self.key_store.as_ref()
    }

    /// Resolve the identity behind a raw bearer token.
    pub async fn authenticate(&self, raw: &str) -> Result<Identity> {
        let result = self.authenticate_token(raw).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        telemetry_metrics::counter!("auth_attempts_total", "outcome" => outcome).increment(1);
        result.map(|verified| verified.identity)
    }

    /// Like [`authenticate`](Self::authenticate), returning the full verification
    pub async fn authenticate_token(&self, raw: &str) -> Result<VerifiedToken> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::MissingCredentials);
        }

        let digest = TokenDigest::of(raw);
        match self.cache.lookup(&digest).await {
            Ok(Some(verified)) if verified.expires_at > now_secs() => {
                self.check_revoked(&verified).await?;
                telemetry_metrics::counter!("auth_cache_hits_total").increment(1);
                debug!(fingerprint = %verified.fingerprint, "Validation cache hit");
                return Ok(verified);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Validation cache lookup failed, verifying directly"),
        }

        let verified = self.verify_uncached(raw).await?;
        self.check_revoked(&verified).await?;

        if let Err(e) = self.cache.put(digest, verified.clone(), self.cache_ttl).await {
            warn!(error = %e, "Failed to cache validation");
        }
        Ok(verified)
    }

    /// Count one request against the caller's quota for `endpoint`
    pub fn check_rate(&self, caller: &Caller, endpoint: &EndpointClass) -> RateDecision {
        self.rate_limiter.allow(caller, endpoint)
    }

    /// Revoke a token. Expired tokens are a no-op; forged tokens are rejected.
    pub async fn revoke(&self, raw: &str) -> Result<()> {
        let verified = match self.verify_uncached(raw.trim()).await {
            Ok(verified) => verified,
            Err(Error::Expired) => {
                debug!("Revoking an expired token, nothing to do");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let ttl = verified.remaining(now_secs());
        if ttl.is_zero() {
            return Ok(());
        }
        self.revocation.revoke(&verified.fingerprint, ttl).await?;
        if let Err(e) = self.cache.invalidate(&verified.fingerprint).await {
            warn!(error = %e, fingerprint = %verified.fingerprint, "Failed to invalidate cached validation");
        }

        audit::emit(&AuditEvent::revoked(
            &verified.identity,
            &verified.fingerprint,
            verified.expires_at,
        ));
        Ok(())
    }

    /// Revoke every token of `user_id` issued up to now.
    pub async fn revoke_user(&self, user_id: &str) -> Result<()> {
        self.revocation
            .revoke_user(user_id, now_secs(), self.user_revocation_ttl)
            .await?;
        if let Err(e) = self.cache.invalidate_user(user_id).await {
            warn!(error = %e, user_id = %user_id, "Failed to invalidate cached validations");
        }
        audit::emit(&AuditEvent::user_revoked(user_id));
        Ok(())
    }

    /// Issue a local token; `ttl` defaults to the access token lifetime.
    pub fn issue(&self, subject: &Subject, ttl: Option<Duration>) -> Result<IssuedToken> {
        let signer = self.signer()?;
        let issued = signer.issue(subject, ttl.unwrap_or_else(|| signer.access_ttl()))?;
        audit::emit(&AuditEvent::issued(
            subject.user_id.as_deref().unwrap_or(&subject.username),
            &issued.jti,
            issued.expires_at,
        ));
        Ok(issued)
    }

    /// Reissue a valid, unrevoked local token.
    pub async fn refresh(&self, raw: &str) -> Result<IssuedToken> {
        let signer = self.signer()?;
        let raw = raw.trim();
        let claims = match signer.verify(raw) {
            Ok(claims) => claims,
            Err(Error::Expired) => return Err(Error::NotRefreshable),
            Err(e) => return Err(e),
        };
        let verified = VerifiedToken::from_claims(raw, &claims);
        self.check_revoked(&verified).await?;

        let issued = signer.refresh(raw)?;
        audit::emit(&AuditEvent::refreshed(
            &verified.identity.user_id,
            &issued.jti,
            issued.expires_at,
        ));
        Ok(issued)
    }

    /// Breaker states and identity service health
    pub async fn health(&self) -> HealthReport {
        let identity_service = match &self.identity_client {
            Some(client) => Some(client.health().await),
            None => None,
        };
        let circuit_breakers = self
            .breakers
            .snapshot()
            .into_iter()
            .map(|(name, state)| BreakerStatus {
                message: self.breakers.get(&name).status_message(),
                state: state.as_str(),
                name,
            })
            .collect();

        HealthReport {
            circuit_breakers,
            identity_service,
        }
    }

    /// Start the key refresher, reapers and sweepers.
    ///
    /// Every task stops when `shutdown` fires.
    pub fn spawn_maintenance(&self, config: &Config, shutdown: &broadcast::Sender<()>) {
        if let Some(store) = &self.key_store {
            keys::spawn_refresher(
                Arc::clone(store),
                config.remote.refresh_interval,
                shutdown.subscribe(),
            );
        }
        if config.revocation.enabled {
            revocation::spawn_reaper(
                Arc::clone(&self.revocation),
                config.revocation.reap_interval,
                shutdown.subscribe(),
            );
        }
        if config.cache.enabled {
            cache::spawn_reaper(
                Arc::clone(&self.cache),
                config.cache.reap_interval,
                shutdown.subscribe(),
            );
        }
        if config.rate_limit.enabled {
            failsafe::spawn_sweeper(
                Arc::clone(&self.rate_limiter),
                config.rate_limit.sweep_interval,
                shutdown.subscribe(),
            );
        }
        if config.lockout.enabled {
            failsafe::spawn_lockout_sweeper(
                Arc::clone(&self.lockout),
                config.lockout.window,
                shutdown.subscribe(),
            );
        }
        info!("Background maintenance tasks started");
    }

    fn signer(&self) -> Result<&Arc<LocalSigner>> {
        self.signer
            .as_ref()
            .ok_or_else(|| Error::Config("local signing is not configured".into()))
    }

    async fn verify_uncached(&self, raw: &str) -> Result<VerifiedToken> {
        let shape = match UnverifiedToken::parse(raw) {
            Ok(shape) => shape,
            Err(e) => {
                return match &self.remote {
                    Some(remote) if self.remote_accepts_opaque => remote.verify(raw).await,
                    _ => Err(e),
                };
            }
        };

        let local_shaped = shape.kid.is_none()
            && shape
                .iss
                .as_deref()
                .is_none_or(|iss| iss == self.local_issuer);

        let verifier = if local_shaped {
            self.local.as_ref()
        } else {
            self.remote.as_ref()
        };
        let Some(verifier) = verifier else {
            debug!(iss = ?shape.iss, kid = ?shape.kid, "No verifier for token");
            return Err(Error::InvalidIssuer("issuer not accepted".into()));
        };

        verifier.verify(raw).await
    }

    /// Fail-closed: a store error rejects the token.
    async fn check_revoked(&self, verified: &VerifiedToken) -> Result<()> {
        match self.revocation.is_revoked(&verified.fingerprint).await {
            Ok(false) => {}
            Ok(true) => return Err(Error::Revoked),
            Err(e) => {
                error!(error = %e, "Revocation store unavailable, rejecting token");
                return Err(Error::Revoked);
            }
        }

        match self
            .revocation
            .user_revoked_at(&verified.identity.user_id)
            .await
        {
            Ok(Some(cutoff)) if verified.issued_at <= cutoff => Err(Error::Revoked),
            Ok(_) => Ok(()),
            Err(e) => {
                error!(error = %e, "Revocation store unavailable, rejecting token");
                Err(Error::Revoked)
            }
        }
    }
}

/// Constructor injection for [`AuthGateway`]
#[derive(Default)]
pub struct AuthGatewayBuilder {
    local_issuer: Option<String>,
    signer: Option<Arc<LocalSigner>>,
    local: Option<Arc<dyn TokenVerifier>>,
    remote: Option<Arc<dyn TokenVerifier>>,
    remote_accepts_opaque: bool,
    revocation: Option<Arc<dyn RevocationStore>>,
    cache: Option<Arc<dyn ValidationCache>>,
    cache_ttl: Option<Duration>,
    user_revocation_ttl: Option<Duration>,
    rate_limiter: Option<Arc<RateLimiter>>,
    lockout: Option<Arc<LockoutTracker>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    key_store: Option<Arc<KeyStore>>,
    identity_client: Option<Arc<IdentityClient>>,
}

impl AuthGatewayBuilder {
    /// Signer for issuing, refreshing and verifying local tokens
    #[must_use]
    pub fn local_signer(mut self, signer: Arc<LocalSigner>) -> Self {
        self.local_issuer.get_or_insert_with(|| signer.issuer().to_string());
        self.local
            .get_or_insert_with(|| Arc::clone(&signer) as Arc<dyn TokenVerifier>);
        self.signer = Some(signer);
        self
    }

    /// Verifier for local tokens (defaults to the signer)
    #[must_use]
    pub fn local_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.local = Some(verifier);
        self
    }

    /// Issuer that routes tokens to the local verifier
    #[must_use]
    pub fn local_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.local_issuer = Some(issuer.into());
        self
    }

    /// Verifier for identity-provider tokens
    #[must_use]
    pub fn remote_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.remote = Some(verifier);
        self
    }

    /// Send tokens that are not JWT-shaped to the remote verifier
    #[must_use]
    pub fn remote_accepts_opaque(mut self, accepts: bool) -> Self {
        self.remote_accepts_opaque = accepts;
        self
    }

    /// Revocation store (defaults to in-memory)
    #[must_use]
    pub fn revocation_store(mut self, store: Arc<dyn RevocationStore>) -> Self {
        self.revocation = Some(store);
        self
    }

    /// Validation cache (defaults to in-memory)
    #[must_use]
    pub fn validation_cache(mut self, cache: Arc<dyn ValidationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validation cache TTL
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Lifetime of user-wide revocations
    #[must_use]
    pub fn user_revocation_ttl(mut self, ttl: Duration) -> Self {
        self.user_revocation_ttl = Some(ttl);
        self
    }

    /// Rate limiter (defaults to the default quotas)
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Failed-authentication lockout (defaults to the default thresholds)
    #[must_use]
    pub fn lockout(mut self, tracker: Arc<LockoutTracker>) -> Self {
        self.lockout = Some(tracker);
        self
    }

    /// Breaker registry reported by [`AuthGateway::health`]
    #[must_use]
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// JWKS key store to refresh in the background
    #[must_use]
    pub fn key_store(mut self, store: Arc<KeyStore>) -> Self {
        self.key_store = Some(store);
        self
    }

    /// Identity service client checked by [`AuthGateway::health`]
    #[must_use]
    pub fn identity_client(mut self, client: Arc<IdentityClient>) -> Self {
        self.identity_client = Some(client);
        self
    }

    /// Assemble the gateway
    pub fn build(self) -> Result<AuthGateway> {
        if self.local.is_none() && self.remote.is_none() {
            return Err(Error::Config("no token verifier configured".into()));
        }
        let local_issuer = match (self.local_issuer, &self.local) {
            (Some(issuer), _) => issuer,
            (None, None) => String::new(),
            (None, Some(_)) => {
                return Err(Error::Config("local verifier needs a local issuer".into()));
            }
        };

        Ok(AuthGateway {
            local_issuer,
            signer: self.signer,
            local: self.local,
            remote: self.remote,
            remote_accepts_opaque: self.remote_accepts_opaque,
            revocation: self
                .revocation
                .unwrap_or_else(|| Arc::new(InMemoryRevocationStore::new())),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(InMemoryValidationCache::new(DEFAULT_CACHE_ENTRIES))),
            cache_ttl: self.cache_ttl.unwrap_or(DEFAULT_CACHE_TTL),
            user_revocation_ttl: self
                .user_revocation_ttl
                .unwrap_or(DEFAULT_USER_REVOCATION_TTL),
            rate_limiter: self
                .rate_limiter
                .unwrap_or_else(|| Arc::new(RateLimiter::new(&RateLimitConfig::default()))),
            lockout: self
                .lockout
                .unwrap_or_else(|| Arc::new(LockoutTracker::new(&LockoutConfig::default()))),
            breakers: self.breakers.unwrap_or_else(|| {
                Arc::new(CircuitBreakerRegistry::new(Default::default()))
            }),
            key_store: self.key_store,
            identity_client: self.identity_client,
        })
    }
}
