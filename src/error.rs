//! Error types for the trust gateway
//!
//! Every variant carries a stable, non-leaking [`code`](Error::code) that is
//! the only thing request handlers expose to callers.

use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use jsonwebtoken::errors::ErrorKind;
use thiserror::Error;

/// Result type alias for the trust gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Trust gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Token is structurally invalid (bad segments, bad base64, bad JSON, missing claims)
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Signature did not verify, or the algorithm is not acceptable for the key
    #[error("Invalid token signature")]
    InvalidSignature,

    /// `exp` has passed
    #[error("Token expired")]
    Expired,

    /// `nbf` is in the future
    #[error("Token not yet valid")]
    NotYetValid,

    /// `iss` does not match the configured issuer
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// No trusted verification key for the `kid`
    #[error("Verification key not found: {0}")]
    KeyNotFound(String),

    /// Token (or every token of its user) has been revoked
    #[error("Token revoked")]
    Revoked,

    /// Remote dependency unavailable (circuit open, timeout, transport failure)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Caller exceeded its request budget
    #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Time until the caller's window resets
        retry_after: Duration,
    },

    /// Client address locked after repeated authentication failures
    #[error("Too many failed attempts, locked for {}s", retry_after.as_secs())]
    LockedOut {
        /// Time until the lockout ends
        retry_after: Duration,
    },

    /// Token cannot be refreshed because it already expired
    #[error("Token is expired and cannot be refreshed")]
    NotRefreshable,

    /// No bearer token on a route that requires one
    #[error("Missing bearer credentials")]
    MissingCredentials,

    /// Authenticated caller lacks the role a route requires
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code surfaced to callers
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_token",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::NotYetValid => "token_not_yet_valid",
            Self::InvalidIssuer(_) => "invalid_issuer",
            Self::KeyNotFound(_) => "key_not_found",
            Self::Revoked => "token_revoked",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::LockedOut { .. } => "too_many_failed_attempts",
            Self::NotRefreshable => "not_refreshable",
            Self::MissingCredentials => "missing_credentials",
            Self::Forbidden(_) => "forbidden",
            Self::Config(_) => "config_error",
            Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Fixed human-readable message for a response body (never internal text)
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Malformed(_)
            | Self::InvalidSignature
            | Self::InvalidIssuer(_)
            | Self::KeyNotFound(_) => "The bearer token is invalid",
            Self::Expired => "The bearer token has expired",
            Self::NotYetValid => "The bearer token is not yet valid",
            Self::Revoked => "The bearer token has been revoked",
            Self::ServiceUnavailable(_) => "The bearer token could not be verified",
            Self::RateLimited { .. } => "Too many requests, try again later",
            Self::LockedOut { .. } => {
                "Access is temporarily locked after repeated authentication failures"
            }
            Self::NotRefreshable => "The token can no longer be refreshed",
            Self::MissingCredentials => "Use: Authorization: Bearer <token>",
            Self::Forbidden(_) => "Insufficient role for this resource",
            _ => "Internal error",
        }
    }

    /// HTTP status for the inbound request contract.
    ///
    /// `ServiceUnavailable` maps to 401: a token that cannot be verified is
    /// rejected, never admitted.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Malformed(_)
            | Self::InvalidSignature
            | Self::Expired
            | Self::NotYetValid
            | Self::InvalidIssuer(_)
            | Self::KeyNotFound(_)
            | Self::Revoked
            | Self::ServiceUnavailable(_)
            | Self::NotRefreshable
            | Self::MissingCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } | Self::LockedOut { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error means the remote dependency itself misbehaved.
    ///
    /// Only these outcomes count against a circuit breaker.
    #[must_use]
    pub fn is_dependency_failure(&self) -> bool {
        match self {
            Self::ServiceUnavailable(_) | Self::Io(_) | Self::Internal(_) => true,
            Self::Http(e) => e.status().is_none_or(|s| s.is_server_error()),
            _ => false,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer("issuer mismatch".to_string()),
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat => Self::InvalidSignature,
            ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => {
                Self::InvalidIssuer("missing issuer".to_string())
            }
            ErrorKind::MissingRequiredClaim(claim) => {
                Self::Malformed(format!("missing required claim '{claim}'"))
            }
            _ => Self::Malformed(err.to_string()),
        }
    }
}
