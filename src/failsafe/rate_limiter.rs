//! Rate limiting implementation
//!
//! Fixed-window counters keyed by `(caller, endpoint class)`. The caller class
//! decides the quota and is derived from the verified [`Identity`] only.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::{ClassQuotas, RateLimitConfig};
use crate::token::{Identity, now_secs};

/// Who is calling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// No verified token; keyed by client address
    Anonymous(IpAddr),
    /// Verified identity
    Authenticated(Identity),
}

impl Caller {
    /// Counter key for this caller
    #[must_use]
    pub fn key(&self) -> CallerKey {
        match self {
            Self::Anonymous(ip) => CallerKey::Address(*ip),
            Self::Authenticated(identity) => CallerKey::User(identity.user_id.clone()),
        }
    }
}

/// Counter identity of a caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerKey {
    /// Authenticated user id
    User(String),
    /// Client address
    Address(IpAddr),
}

/// Quota tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerClass {
    /// No token
    Anonymous,
    /// Regular user
    Authenticated,
    /// User holding an elevated role
    Elevated,
}

/// Named group of endpoints sharing a quota
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointClass(String);

impl EndpointClass {
    /// Class named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Class name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EndpointClass {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed counter key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(pub CallerKey, pub EndpointClass);

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted
    Allowed {
        /// Quota for the window
        limit: u32,
        /// Requests left in the window
        remaining: u32,
        /// Window reset (Unix seconds)
        reset_at: u64,
    },
    /// Request rejected
    Throttled {
        /// Quota for the window
        limit: u32,
        /// Time until the window resets; always non-zero
        retry_after: Duration,
        /// Window reset (Unix seconds)
        reset_at: u64,
    },
    /// Not subject to a quota
    Exempt,
}

impl RateDecision {
    /// Whether the request may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Throttled { .. })
    }
}

#[derive(Debug)]
struct Counter {
    window_start: Instant,
    count: u32,
}

/// Per-caller fixed-window rate limiter
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    defaults: ClassQuotas,
    endpoints: HashMap<String, ClassQuotas>,
    elevated_roles: Vec<String>,
    counters: DashMap<RateKey, Counter>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: config.window,
            defaults: config.quotas,
            endpoints: config.endpoints.clone(),
            elevated_roles: config.elevated_roles.clone(),
            counters: DashMap::new(),
        }
    }

    /// Quota tier of `caller`
    #[must_use]
    pub fn classify(&self, caller: &Caller) -> CallerClass {
        match caller {
            Caller::Anonymous(_) => CallerClass::Anonymous,
            Caller::Authenticated(identity) if identity.has_any_role(&self.elevated_roles) => {
                CallerClass::Elevated
            }
            Caller::Authenticated(_) => CallerClass::Authenticated,
        }
    }

    /// Requests per window for `class` on `endpoint` (0 = unlimited)
    #[must_use]
    pub fn quota(&self, class: CallerClass, endpoint: &EndpointClass) -> u32 {
        let quotas = self.endpoints.get(endpoint.as_str()).unwrap_or(&self.defaults);
        match class {
            CallerClass::Anonymous => quotas.anonymous,
            CallerClass::Authenticated => quotas.authenticated,
            CallerClass::Elevated => quotas.elevated,
        }
    }

    /// Count one request from `caller` against `endpoint`.
    pub fn allow(&self, caller: &Caller, endpoint: &EndpointClass) -> RateDecision {
        if !self.enabled {
            return RateDecision::Exempt;
        }
        let limit = self.quota(self.classify(caller), endpoint);
        if limit == 0 {
            return RateDecision::Exempt;
        }

        let now = Instant::now();
        // The entry guard holds the shard lock: reset, check and increment are one step.
        let mut counter = self
            .counters
            .entry(RateKey(caller.key(), endpoint.clone()))
            .or_insert_with(|| Counter {
                window_start: now,
                count: 0,
            });

        let mut elapsed = now.saturating_duration_since(counter.window_start);
        if elapsed >= self.window {
            counter.window_start = now;
            counter.count = 0;
            elapsed = Duration::ZERO;
        }

        let reset_in = self.window.saturating_sub(elapsed);
        let reset_at = now_secs() + reset_in.as_secs() + u64::from(reset_in.subsec_nanos() > 0);

        if counter.count < limit {
            counter.count += 1;
            RateDecision::Allowed {
                limit,
                remaining: limit - counter.count,
                reset_at,
            }
        } else {
            drop(counter);
            debug!(caller = ?caller.key(), endpoint = %endpoint, limit, "Rate limit exceeded");
            telemetry_metrics::counter!("rate_limit_throttled_total", "endpoint" => endpoint.to_string())
                .increment(1);
            RateDecision::Throttled {
                limit,
                retry_after: reset_in.max(Duration::from_millis(1)),
                reset_at,
            }
        }
    }

    /// Drop counters whose window has elapsed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.counters.len();
        let window = self.window;
        self.counters
            .retain(|_, counter| counter.window_start.elapsed() < window);
        before.saturating_sub(self.counters.len())
    }

    /// Live counters
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.counters.len()
    }
}

/// Spawn a background task that sweeps elapsed counters every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = limiter.sweep_expired();
                    if swept > 0 {
                        debug!(count = swept, "Swept elapsed rate limit counters");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Rate limit sweeper shutting down");
                    break;
                }
            }
        }
    });
}
