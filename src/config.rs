//! Configuration management

use std::{collections::HashMap, net::SocketAddr, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result, local};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Locally issued tokens
    pub local: LocalTokenConfig,
    /// Remote (identity provider) verification
    pub remote: RemoteConfig,
    /// Revocation store
    pub revocation: RevocationConfig,
    /// Validation cache
    pub cache: CacheConfig,
    /// Circuit breakers protecting remote calls
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-caller rate limiting
    pub rate_limit: RateLimitConfig,
    /// Per-address lockout after repeated authentication failures
    pub lockout: LockoutConfig,
    /// Route rules for the HTTP middleware
    pub routes: Vec<RouteRule>,
    /// Metrics exporter
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Honour `X-Forwarded-For` for the client address (only behind a trusted proxy)
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            trust_forwarded_for: false,
        }
    }
}

/// Local signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTokenConfig {
    /// Shared HMAC secret. Required; validated at startup.
    #[serde(skip_serializing)]
    pub secret: Option<SecretString>,
    /// Issuer written into and required from local tokens
    pub issuer: String,
    /// HMAC algorithm (`HS256`, `HS384`, `HS512`)
    pub algorithm: String,
    /// Lifetime of issued access tokens
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Clock-skew leeway applied to `exp`/`nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for LocalTokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            issuer: "focushive-backend".to_string(),
            algorithm: "HS256".to_string(),
            access_token_ttl: Duration::from_secs(3600),
            leeway: Duration::ZERO,
        }
    }
}

/// How tokens from the identity provider are checked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// Verify signatures locally against published JWKS keys
    #[default]
    Jwks,
    /// Ask the identity service to validate every token
    Introspection,
}

/// Remote verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Accept tokens from the identity provider
    pub enabled: bool,
    /// Verification mode
    pub mode: RemoteMode,
    /// Expected `iss` (exact match)
    pub issuer: String,
    /// Optional expected `aud`
    pub audience: Option<String>,
    /// JWKS document URL (jwks mode)
    pub jwks_url: Option<Url>,
    /// Identity service base URL (validate and health calls)
    pub identity_base_url: Option<Url>,
    /// Clock-skew leeway applied to `exp`/`nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// How long a fetched key is trusted without a refresh
    #[serde(with = "humantime_serde")]
    pub key_ttl: Duration,
    /// Background JWKS refresh interval
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Minimum spacing between forced (cache-miss) refreshes
    #[serde(with = "humantime_serde")]
    pub forced_refresh_period: Duration,
    /// Forced refreshes allowed in a burst
    pub forced_refresh_burst: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RemoteMode::Jwks,
            issuer: "focushive-identity".to_string(),
            audience: None,
            jwks_url: None,
            identity_base_url: None,
            leeway: Duration::from_secs(30),
            key_ttl: Duration::from_secs(3600),
            refresh_interval: Duration::from_secs(300),
            forced_refresh_period: Duration::from_secs(10),
            forced_refresh_burst: 3,
        }
    }
}

/// Revocation store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Enable revocation checks
    pub enabled: bool,
    /// How often expired entries are reaped
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// Upper bound on any token lifetime; user-wide revocations live this long
    #[serde(with = "humantime_serde")]
    pub max_token_lifetime: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reap_interval: Duration::from_secs(60),
            max_token_lifetime: Duration::from_secs(24 * 3600),
        }
    }
}

/// Validation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the validation cache
    pub enabled: bool,
    /// Entry TTL (must be shorter than `local.access_token_ttl`)
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of cached validations
    pub max_entries: usize,
    /// How often expired entries are reaped
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Number of recent outcomes considered
    pub sliding_window_size: usize,
    /// Outcomes required before the failure rate is evaluated
    pub minimum_calls: usize,
    /// Failure rate (percent) at or above which the circuit opens
    pub failure_rate_threshold: f64,
    /// Time spent open before trial calls are let through
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open: Duration,
    /// Trial calls permitted while half-open
    pub permitted_calls_in_half_open: u32,
    /// Hard timeout for a protected call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Successful calls slower than this count as failures
    #[serde(with = "humantime_serde")]
    pub slow_call_threshold: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sliding_window_size: 10,
            minimum_calls: 5,
            failure_rate_threshold: 50.0,
            wait_duration_in_open: Duration::from_secs(30),
            permitted_calls_in_half_open: 2,
            call_timeout: Duration::from_secs(3),
            slow_call_threshold: Duration::from_secs(2),
        }
    }
}

/// Requests allowed per window for each caller class. `0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassQuotas {
    /// Callers without a token
    pub anonymous: u32,
    /// Authenticated users
    pub authenticated: u32,
    /// Users holding an elevated role
    pub elevated: u32,
}

impl Default for ClassQuotas {
    fn default() -> Self {
        Self {
            anonymous: 60,
            authenticated: 300,
            elevated: 1000,
        }
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Fixed window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Default quotas
    pub quotas: ClassQuotas,
    /// Roles that put a caller in the elevated class
    pub elevated_roles: Vec<String>,
    /// Quota overrides keyed by endpoint class
    pub endpoints: HashMap<String, ClassQuotas>,
    /// How often elapsed counters are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            quotas: ClassQuotas::default(),
            elevated_roles: vec!["ADMIN".to_string(), "ROLE_ADMIN".to_string()],
            endpoints: HashMap::new(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Failed-authentication lockout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Track failed attempts per client address
    pub enabled: bool,
    /// Failures within `window` that lock the address
    pub max_failed_attempts: u32,
    /// Window in which failures are counted, from the first failure
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How long a locked address is rejected, from its last failure
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failed_attempts: 20,
            window: Duration::from_secs(5 * 60),
            duration: Duration::from_secs(15 * 60),
        }
    }
}

/// Route rule for the HTTP middleware, matched by longest path prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix
    pub prefix: String,
    /// Endpoint class used for rate limiting
    #[serde(default = "default_endpoint_class")]
    pub class: String,
    /// Admit anonymous callers
    #[serde(default)]
    pub public: bool,
    /// Role required to access the route
    #[serde(default)]
    pub required_role: Option<String>,
}

fn default_endpoint_class() -> String {
    "default".to_string()
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter
    pub enabled: bool,
    /// Scrape listener address
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // HIVE_TRUST_LOCAL__SECRET -> local.secret
        figment = figment.merge(Env::prefixed("HIVE_TRUST_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Every failure is a [`Error::Config`].
    pub fn validate(&self) -> Result<()> {
        local::validate_secret(self.local.secret.as_ref())?;
        local::parse_algorithm(&self.local.algorithm)?;

        if self.local.access_token_ttl.is_zero() {
            return Err(Error::Config("local.access_token_ttl must be > 0".into()));
        }
        if self.cache.enabled && self.cache.ttl >= self.local.access_token_ttl {
            return Err(Error::Config(format!(
                "cache.ttl ({}s) must be shorter than local.access_token_ttl ({}s)",
                self.cache.ttl.as_secs(),
                self.local.access_token_ttl.as_secs()
            )));
        }

        if self.remote.enabled {
            if self.remote.issuer == self.local.issuer {
                return Err(Error::Config(
                    "remote.issuer must differ from local.issuer".into(),
                ));
            }
            match self.remote.mode {
                RemoteMode::Jwks if self.remote.jwks_url.is_none() => {
                    return Err(Error::Config(
                        "remote.jwks_url is required in jwks mode".into(),
                    ));
                }
                RemoteMode::Introspection if self.remote.identity_base_url.is_none() => {
                    return Err(Error::Config(
                        "remote.identity_base_url is required in introspection mode".into(),
                    ));
                }
                _ => {}
            }
        }

        let cb = &self.circuit_breaker;
        if cb.sliding_window_size == 0 || cb.minimum_calls == 0 {
            return Err(Error::Config(
                "circuit_breaker window and minimum_calls must be > 0".into(),
            ));
        }
        if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 100.0) {
            return Err(Error::Config(
                "circuit_breaker.failure_rate_threshold must be in (0, 100]".into(),
            ));
        }
        if cb.permitted_calls_in_half_open == 0 {
            return Err(Error::Config(
                "circuit_breaker.permitted_calls_in_half_open must be > 0".into(),
            ));
        }

        if self.rate_limit.enabled && self.rate_limit.window.is_zero() {
            return Err(Error::Config("rate_limit.window must be > 0".into()));
        }

        let lockout = &self.lockout;
        if lockout.enabled
            && (lockout.max_failed_attempts == 0
                || lockout.window.is_zero()
                || lockout.duration.is_zero())
        {
            return Err(Error::Config(
                "lockout max_failed_attempts, window and duration must be > 0".into(),
            ));
        }

        // background task periods; a zero period cannot be scheduled
        let intervals = [
            ("remote.refresh_interval", self.remote.enabled, self.remote.refresh_interval),
            ("revocation.reap_interval", self.revocation.enabled, self.revocation.reap_interval),
            ("cache.reap_interval", self.cache.enabled, self.cache.reap_interval),
            ("rate_limit.sweep_interval", self.rate_limit.enabled, self.rate_limit.sweep_interval),
        ];
        for (name, enabled, interval) in intervals {
            if enabled && interval.is_zero() {
                return Err(Error::Config(format!("{name} must be > 0")));
            }
        }

        for rule in &self.routes {
            if !rule.prefix.starts_with('/') {
                return Err(Error::Config(format!(
                    "route prefix '{}' must start with '/'",
                    rule.prefix
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.local.secret = Some(SecretString::from("kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA".to_string()));
        config
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.circuit_breaker.sliding_window_size, 10);
        assert_eq!(config.rate_limit.quotas.authenticated, 300);
        assert_eq!(config.remote.leeway, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_secret_rejected() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_cache_ttl_must_be_shorter_than_token_ttl() {
        let mut config = valid();
        config.cache.ttl = config.local.access_token_ttl;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.cache.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_jwks_requires_url() {
        let mut config = valid();
        config.remote.enabled = true;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.remote.jwks_url = Some(Url::parse("http://idp.local/.well-known/jwks.json").unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_introspection_requires_base_url() {
        let mut config = valid();
        config.remote.enabled = true;
        config.remote.mode = RemoteMode::Introspection;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_failure_rate_bounds() {
        let mut config = valid();
        config.circuit_breaker.failure_rate_threshold = 0.0;
        assert!(config.validate().is_err());
        config.circuit_breaker.failure_rate_threshold = 100.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_route_prefix_must_be_absolute() {
        let mut config = valid();
        config.routes.push(RouteRule {
            prefix: "api".into(),
            class: default_endpoint_class(),
            public: false,
            required_role: None,
        });
        assert!(config.validate().is_err());
    }
}
