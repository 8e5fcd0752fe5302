//! Bound on forced (cache-miss) key refreshes

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Permits at most `burst` forced refreshes, then one per `period`.
///
/// Unknown `kid`s sent by an attacker must not turn into a stream of JWKS
/// fetches.
pub struct RefreshThrottle {
    limiter: DirectLimiter,
}

impl RefreshThrottle {
    /// Create a throttle
    #[must_use]
    pub fn new(period: Duration, burst: u32) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period.max(Duration::from_millis(1)))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        Self {
            limiter: GovernorLimiter::direct(quota),
        }
    }

    /// Take a permit if one is available
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
