//! Rate limiter integration tests - quotas per caller class and endpoint

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use hive_trust::config::{ClassQuotas, RateLimitConfig};
use hive_trust::failsafe::{Caller, CallerClass, EndpointClass, RateDecision, RateLimiter};
use hive_trust::token::Identity;

fn user(id: &str, roles: &[&str]) -> Caller {
    Caller::Authenticated(Identity {
        user_id: id.into(),
        username: id.into(),
        email: None,
        roles: roles.iter().map(|r| (*r).to_string()).collect(),
    })
}

fn config(anonymous: u32, authenticated: u32, elevated: u32, window: Duration) -> RateLimitConfig {
    RateLimitConfig {
        window,
        quotas: ClassQuotas {
            anonymous,
            authenticated,
            elevated,
        },
        ..RateLimitConfig::default()
    }
}

#[test]
fn test_quota_then_throttle() {
    let limiter = RateLimiter::new(&config(2, 3, 5, Duration::from_secs(60)));
    let caller = user("u-1", &[]);
    let endpoint = EndpointClass::default();

    for expected_remaining in [2, 1, 0] {
        match limiter.allow(&caller, &endpoint) {
            RateDecision::Allowed { limit, remaining, .. } => {
                assert_eq!(limit, 3);
                assert_eq!(remaining, expected_remaining);
            }
            other => panic!("expected allowed, got {other:?}"),
        }
    }

    let RateDecision::Throttled {
        limit, retry_after, ..
    } = limiter.allow(&caller, &endpoint)
    else {
        panic!("fourth request must be throttled");
    };
    assert_eq!(limit, 3);
    assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(60));
}

#[test]
fn test_classes_get_their_own_quota() {
    let limiter = RateLimiter::new(&config(1, 2, 4, Duration::from_secs(60)));
    let anonymous = Caller::Anonymous(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
    let admin = user("admin", &["ADMIN"]);

    assert_eq!(limiter.classify(&anonymous), CallerClass::Anonymous);
    assert_eq!(limiter.classify(&admin), CallerClass::Elevated);
    assert_eq!(limiter.classify(&user("u", &["USER"])), CallerClass::Authenticated);

    let endpoint = EndpointClass::default();
    assert!(limiter.allow(&anonymous, &endpoint).is_allowed());
    assert!(!limiter.allow(&anonymous, &endpoint).is_allowed());

    let admitted = (0..6)
        .filter(|_| limiter.allow(&admin, &endpoint).is_allowed())
        .count();
    assert_eq!(admitted, 4);
}

#[test]
fn test_endpoint_override_and_independent_counters() {
    let mut cfg = config(1, 1, 1, Duration::from_secs(60));
    cfg.endpoints.insert(
        "auth".into(),
        ClassQuotas {
            anonymous: 5,
            authenticated: 5,
            elevated: 5,
        },
    );
    let limiter = RateLimiter::new(&cfg);
    let caller = user("u-1", &[]);

    let auth = EndpointClass::new("auth");
    assert_eq!(limiter.quota(CallerClass::Authenticated, &auth), 5);

    assert!(limiter.allow(&caller, &EndpointClass::default()).is_allowed());
    assert!(!limiter.allow(&caller, &EndpointClass::default()).is_allowed());
    // Separate counter for the other endpoint class
    assert!(limiter.allow(&caller, &auth).is_allowed());
    // And for the other user
    assert!(limiter.allow(&user("u-2", &[]), &EndpointClass::default()).is_allowed());
}

#[test]
fn test_zero_quota_and_disabled_are_exempt() {
    let limiter = RateLimiter::new(&config(0, 1, 1, Duration::from_secs(60)));
    let anonymous = Caller::Anonymous(IpAddr::V4(Ipv4Addr::LOCALHOST));
    for _ in 0..100 {
        assert_eq!(limiter.allow(&anonymous, &EndpointClass::default()), RateDecision::Exempt);
    }

    let disabled = RateLimiter::new(&RateLimitConfig {
        enabled: false,
        ..config(1, 1, 1, Duration::from_secs(60))
    });
    assert_eq!(
        disabled.allow(&user("u", &[]), &EndpointClass::default()),
        RateDecision::Exempt
    );
    assert_eq!(disabled.tracked(), 0);
}

#[tokio::test]
async fn test_window_rollover_restores_quota() {
    let limiter = RateLimiter::new(&config(1, 1, 1, Duration::from_millis(50)));
    let caller = user("u-1", &[]);
    let endpoint = EndpointClass::default();

    assert!(limiter.allow(&caller, &endpoint).is_allowed());
    assert!(!limiter.allow(&caller, &endpoint).is_allowed());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(limiter.allow(&caller, &endpoint).is_allowed());
}

#[tokio::test]
async fn test_sweep_drops_elapsed_counters() {
    let limiter = RateLimiter::new(&config(5, 5, 5, Duration::from_millis(20)));
    limiter.allow(&user("a", &[]), &EndpointClass::default());
    limiter.allow(&user("b", &[]), &EndpointClass::default());
    assert_eq!(limiter.tracked(), 2);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(limiter.sweep_expired(), 2);
    assert_eq!(limiter.tracked(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_over_admit() {
    let limiter = Arc::new(RateLimiter::new(&config(10, 50, 100, Duration::from_secs(60))));
    let admitted = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..200)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            tokio::spawn(async move {
                if limiter
                    .allow(&user("shared", &[]), &EndpointClass::default())
                    .is_allowed()
                {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 50);
}

#[test]
fn test_reset_is_in_the_future() {
    let limiter = RateLimiter::new(&config(1, 1, 1, Duration::from_secs(60)));
    let RateDecision::Allowed { reset_at, .. } =
        limiter.allow(&user("u", &[]), &EndpointClass::default())
    else {
        panic!("expected allowed");
    };
    let now = hive_trust::token::now_secs();
    assert!(reset_at > now && reset_at <= now + 60);
}

#[test]
fn test_unknown_endpoint_uses_defaults() {
    let limiter = RateLimiter::new(&RateLimitConfig {
        endpoints: HashMap::new(),
        ..RateLimitConfig::default()
    });
    assert_eq!(
        limiter.quota(CallerClass::Authenticated, &EndpointClass::new("nope")),
        300
    );
}
