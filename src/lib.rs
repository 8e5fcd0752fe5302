//! hive-trust library
//!
//! Token validation and trust management for FocusHive services.
//!
//! # Features
//!
//! - **Local tokens**: HMAC-signed JWTs issued, refreshed and verified in-process
//! - **Remote tokens**: identity provider tokens checked against a cached JWKS,
//!   or delegated to the identity service's validate endpoint
//! - **Revocation**: per-token and per-user, bounded by token lifetime
//! - **Validation cache**: keyed by token digest, invalidated on revocation
//! - **Failsafes**: circuit breakers around remote calls, per-caller rate limits
//! - **HTTP middleware**: axum layer enforcing the inbound request contract

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod keys;
pub mod local;
pub mod remote;
pub mod revocation;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("failed to initialise tracing: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("failed to initialise tracing: {e}"))),
    }
}
