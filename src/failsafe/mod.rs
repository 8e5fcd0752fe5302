//! Failsafe mechanisms: circuit breaking, rate limiting, lockout and refresh throttling

mod circuit_breaker;
mod lockout;
mod rate_limiter;
mod refresh_throttle;

pub use circuit_breaker::{CallOutcome, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use lockout::{LockoutTracker, spawn_lockout_sweeper};
pub use rate_limiter::{
    Caller, CallerClass, CallerKey, EndpointClass, RateDecision, RateKey, RateLimiter,
    spawn_sweeper,
};
pub use refresh_throttle::RefreshThrottle;

/// Breaker around JWKS fetches
pub const JWKS_BREAKER: &str = "jwks";
/// Breaker around the identity service validate call
pub const IDENTITY_VALIDATE_BREAKER: &str = "identity-validate";
/// Breaker around the identity service health check
pub const IDENTITY_HEALTH_BREAKER: &str = "identity-health";
