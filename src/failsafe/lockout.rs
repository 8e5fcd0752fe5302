//! Failed-authentication lockout
//!
//! Counts authentication failures per client address. Once an address
//! reaches `max_failed_attempts` within the window it is rejected until
//! `duration` has passed since its last failure, without any token being
//! verified. A successful authentication clears the record.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::LockoutConfig;

#[derive(Debug)]
struct FailedAttempts {
    count: u32,
    first_at: Instant,
    last_at: Instant,
}

/// Per-address failed-attempt tracker
pub struct LockoutTracker {
    enabled: bool,
    max_failed_attempts: u32,
    window: Duration,
    duration: Duration,
    attempts: DashMap<IpAddr, FailedAttempts>,
}

impl LockoutTracker {
    /// Create a new tracker
    #[must_use]
    pub fn new(config: &LockoutConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_failed_attempts: config.max_failed_attempts.max(1),
            window: config.window,
            duration: config.duration,
            attempts: DashMap::new(),
        }
    }

    /// Remaining lockout for `address`, if it is locked
    pub fn locked_for(&self, address: IpAddr) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let remaining = {
            let record = self.attempts.get(&address)?;
            if record.count < self.max_failed_attempts {
                return None;
            }
            self.duration.checked_sub(record.last_at.elapsed())
        };
        match remaining {
            Some(remaining) if !remaining.is_zero() => Some(remaining),
            _ => {
                let expired = self
                    .attempts
                    .remove_if(&address, |_, r| r.last_at.elapsed() >= self.duration);
                if expired.is_some() {
                    info!(%address, "Lockout expired");
                }
                None
            }
        }
    }

    /// Count one failure. Returns the lockout when this failure locks `address`.
    pub fn record_failure(&self, address: IpAddr) -> Option<Duration> {
        if !self.enabled {
            return None;
        }

        let now = Instant::now();
        let count = {
            // The entry guard holds the shard lock: reset and increment are one step.
            let mut record = self.attempts.entry(address).or_insert(FailedAttempts {
                count: 0,
                first_at: now,
                last_at: now,
            });
            if record.count < self.max_failed_attempts
                && now.saturating_duration_since(record.first_at) >= self.window
            {
                record.count = 0;
                record.first_at = now;
            }
            record.count = record.count.saturating_add(1);
            record.last_at = now;
            record.count
        };

        debug!(%address, count, "Failed authentication attempt");
        if count >= self.max_failed_attempts {
            if count == self.max_failed_attempts {
                warn!(%address, attempts = count, "Address locked after repeated authentication failures");
            }
            Some(self.duration)
        } else {
            None
        }
    }

    /// Forget the failures of `address`
    pub fn clear(&self, address: IpAddr) {
        if self.enabled {
            self.attempts.remove(&address);
        }
    }

    /// Drop records whose window and lockout have both passed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.attempts.len();
        let (window, duration) = (self.window, self.duration);
        self.attempts.retain(|_, record| {
            record.first_at.elapsed() < window || record.last_at.elapsed() < duration
        });
        before.saturating_sub(self.attempts.len())
    }

    /// Addresses with a live record
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}

/// Spawn a background task that sweeps stale records every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_lockout_sweeper(
    tracker: Arc<LockoutTracker>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = tracker.sweep_expired();
                    if swept > 0 {
                        debug!(count = swept, "Swept stale lockout records");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Lockout sweeper shutting down");
                    break;
                }
            }
        }
    });
}
