//! Configuration loading tests - YAML files through `Config::load`

use std::io::Write;
use std::time::Duration;

use secrecy::ExposeSecret;

use hive_trust::Error;
use hive_trust::config::{Config, RemoteMode};

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
server:
  port: 9090
  trust_forwarded_for: true
local:
  secret: "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
  access_token_ttl: 15m
remote:
  enabled: true
  mode: jwks
  issuer: focushive-identity
  jwks_url: "http://identity.local/.well-known/jwks.json"
  leeway: 45s
cache:
  ttl: 2m
rate_limit:
  window: 30s
  quotas:
    anonymous: 20
  endpoints:
    auth:
      anonymous: 5
      authenticated: 10
      elevated: 0
routes:
  - prefix: /api/v1/auth
    class: auth
    public: true
  - prefix: /api/v1/admin
    required_role: ADMIN
"#,
    );

    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.server.port, 9090);
    assert!(config.server.trust_forwarded_for);
    assert_eq!(
        config.local.secret.as_ref().unwrap().expose_secret(),
        "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
    );
    assert_eq!(config.local.access_token_ttl, Duration::from_secs(900));
    assert_eq!(config.remote.mode, RemoteMode::Jwks);
    assert_eq!(config.remote.leeway, Duration::from_secs(45));
    assert_eq!(config.cache.ttl, Duration::from_secs(120));
    assert_eq!(config.rate_limit.window, Duration::from_secs(30));
    assert_eq!(config.rate_limit.quotas.anonymous, 20);
    // unspecified quotas keep their defaults
    assert_eq!(config.rate_limit.quotas.authenticated, 300);
    assert_eq!(config.rate_limit.endpoints["auth"].anonymous, 5);

    assert_eq!(config.routes.len(), 2);
    assert!(config.routes[0].public);
    assert_eq!(config.routes[1].class, "default");
    assert_eq!(config.routes[1].required_role.as_deref(), Some("ADMIN"));
}

#[test]
fn test_weak_secret_is_config_error() {
    for secret in ["short", "this-is-my-test-secret-for-the-gateway", "changeme-changeme-changeme-changeme"] {
        let file = write_config(&format!("local:\n  secret: \"{secret}\"\n"));
        assert!(
            matches!(Config::load(Some(file.path())), Err(Error::Config(_))),
            "{secret} should be rejected"
        );
    }
}

#[test]
fn test_cache_ttl_longer_than_token_is_rejected() {
    let file = write_config(
        r#"
local:
  secret: "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
  access_token_ttl: 5m
cache:
  ttl: 10m
"#,
    );
    assert!(matches!(Config::load(Some(file.path())), Err(Error::Config(_))));
}

#[test]
fn test_unsupported_algorithm_is_rejected() {
    let file = write_config(
        r#"
local:
  secret: "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
  algorithm: RS256
"#,
    );
    assert!(matches!(Config::load(Some(file.path())), Err(Error::Config(_))));
}

#[test]
fn test_remote_issuer_must_differ_from_local() {
    let file = write_config(
        r#"
local:
  secret: "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
  issuer: shared
remote:
  enabled: true
  issuer: shared
  jwks_url: "http://identity.local/jwks"
"#,
    );
    assert!(matches!(Config::load(Some(file.path())), Err(Error::Config(_))));
}

#[test]
fn test_invalid_route_prefix_is_rejected() {
    let file = write_config(
        r#"
local:
  secret: "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
routes:
  - prefix: api
"#,
    );
    assert!(matches!(Config::load(Some(file.path())), Err(Error::Config(_))));
}

#[test]
fn test_zero_background_interval_is_rejected() {
    for section in [
        "revocation:\n  reap_interval: 0s",
        "cache:\n  ttl: 1m\n  reap_interval: 0s",
        "rate_limit:\n  sweep_interval: 0s",
        "remote:\n  enabled: true\n  issuer: focushive-identity\n  jwks_url: \"http://identity.local/jwks\"\n  refresh_interval: 0s",
    ] {
        let file = write_config(&format!(
            "local:\n  secret: \"kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA\"\n{section}\n"
        ));
        assert!(
            matches!(Config::load(Some(file.path())), Err(Error::Config(_))),
            "{section} should be rejected"
        );
    }
}

#[test]
fn test_zero_interval_allowed_when_task_disabled() {
    let file = write_config(
        r#"
local:
  secret: "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
revocation:
  enabled: false
  reap_interval: 0s
"#,
    );
    assert!(Config::load(Some(file.path())).is_ok());
}

#[test]
fn test_lockout_section() {
    let file = write_config(
        r#"
local:
  secret: "kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA"
lockout:
  max_failed_attempts: 5
  duration: 2m
"#,
    );
    let config = Config::load(Some(file.path())).unwrap();
    assert!(config.lockout.enabled);
    assert_eq!(config.lockout.max_failed_attempts, 5);
    assert_eq!(config.lockout.duration, Duration::from_secs(120));

    let file = write_config(
        "local:\n  secret: \"kq8Zr2vN5xL1mW9pT4bY7cJ3fH6sD0gA\"\nlockout:\n  max_failed_attempts: 0\n",
    );
    assert!(matches!(Config::load(Some(file.path())), Err(Error::Config(_))));
}
