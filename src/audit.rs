//! Audit logging for token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` under the `audit` target with
//! structured fields, so the trail can be filtered independently of
//! diagnostic logs.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | A local token is issued |
//! | `token.refreshed` | A local token is reissued from a valid one |
//! | `token.revoked` | A single token is revoked |
//! | `user.revoked` | Every token of a user is revoked |
//! | `token.denied` | Authentication failed |

use serde::Serialize;

use crate::token::{Fingerprint, Identity};

/// Structured audit event emitted for every token lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// User the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Fingerprint (jti) of the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Expiry of the affected token (Unix seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Stable error code for denials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl AuditEvent {
    /// Construct a `token.issued` event.
    #[must_use]
    pub fn issued(user_id: &str, jti: &str, expires_at: u64) -> Self {
        Self {
            event: "token.issued",
            user_id: Some(user_id.to_string()),
            fingerprint: Some(jti.to_string()),
            expires_at: Some(expires_at),
            reason: None,
        }
    }

    /// Construct a `token.refreshed` event.
    #[must_use]
    pub fn refreshed(user_id: &str, jti: &str, expires_at: u64) -> Self {
        Self {
            event: "token.refreshed",
            ..Self::issued(user_id, jti, expires_at)
        }
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn revoked(identity: &Identity, fingerprint: &Fingerprint, expires_at: u64) -> Self {
        Self {
            event: "token.revoked",
            user_id: Some(identity.user_id.clone()),
            fingerprint: Some(fingerprint.to_string()),
            expires_at: Some(expires_at),
            reason: None,
        }
    }

    /// Construct a `user.revoked` event.
    #[must_use]
    pub fn user_revoked(user_id: &str) -> Self {
        Self {
            event: "user.revoked",
            user_id: Some(user_id.to_string()),
            fingerprint: None,
            expires_at: None,
            reason: None,
        }
    }

    /// Construct a `token.denied` event.
    #[must_use]
    pub fn denied(reason: &'static str) -> Self {
        Self {
            event: "token.denied",
            user_id: None,
            fingerprint: None,
            expires_at: None,
            reason: Some(reason),
        }
    }
}

/// Emit an audit event under the `audit` target.
///
/// The event is serialized as a JSON blob in the `audit` field:
///
/// ```text
/// INFO audit: audit={"event":"token.revoked","user_id":"u-1",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(target: "audit", audit = %json, "token audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
