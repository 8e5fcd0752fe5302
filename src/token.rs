//! Token data model shared by every verifier
//!
//! A raw bearer token is parsed once into an [`UnverifiedToken`] for routing
//! (`kid` / `iss`), verified into [`Claims`], and surfaced to callers as a
//! [`VerifiedToken`] carrying the resolved [`Identity`].

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Hex characters of the SHA-256 kept for a hash-derived fingerprint
const FINGERPRINT_HEX_LEN: usize = 32;

/// Current Unix time in seconds
#[must_use]
pub fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Decoded token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Stable user id; falls back to `sub`
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Comma-separated role string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Role list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Issued at (seconds)
    pub iat: u64,
    /// Expiry (seconds)
    pub exp: u64,
    /// Not before (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Claims {
    /// Reject claim sets whose lifetime is empty or inverted.
    pub fn check_lifetime(&self) -> Result<()> {
        if self.exp <= self.iat {
            return Err(Error::Malformed("exp must be after iat".into()));
        }
        Ok(())
    }

    /// Fingerprint of the token these claims were decoded from
    #[must_use]
    pub fn fingerprint(&self, raw: &str) -> Fingerprint {
        Fingerprint::for_token(raw, self.jti.as_deref())
    }
}

/// Subject claims supplied when issuing a local token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    /// Username, written as `sub`
    pub username: String,
    /// User id
    pub user_id: Option<String>,
    /// Email
    pub email: Option<String>,
    /// Roles
    pub roles: Vec<String>,
}

impl Subject {
    /// Subject with only a username
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    /// Set the user id
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the email
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Add a role
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

impl From<&Identity> for Subject {
    fn from(identity: &Identity) -> Self {
        Self {
            username: identity.username.clone(),
            user_id: Some(identity.user_id.clone()),
            email: identity.email.clone(),
            roles: identity.roles.clone(),
        }
    }
}

/// Authenticated principal attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable user id
    pub user_id: String,
    /// Username
    pub username: String,
    /// Email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Roles, deduplicated, in claim order
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    /// Resolve an identity from verified claims.
    #[must_use]
    pub fn from_claims(claims: &Claims) -> Self {
        let mut roles: Vec<String> = Vec::new();
        let from_role = claims
            .role
            .as_deref()
            .into_iter()
            .flat_map(|r| r.split(','));
        for role in from_role
            .chain(claims.roles.iter().map(String::as_str))
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            if !roles.iter().any(|r| r == role) {
                roles.push(role.to_string());
            }
        }

        Self {
            user_id: claims
                .user_id
                .clone()
                .unwrap_or_else(|| claims.sub.clone()),
            username: claims.sub.clone(),
            email: claims.email.clone(),
            roles,
        }
    }

    /// Whether the identity holds `role`
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Whether the identity holds any of `roles`
    #[must_use]
    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }
}

/// Revocation key of a token: its `jti`, or a truncated hash of the raw token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint for `raw`, preferring `jti`
    #[must_use]
    pub fn for_token(raw: &str, jti: Option<&str>) -> Self {
        match jti {
            Some(jti) if !jti.is_empty() => Self(jti.to_string()),
            _ => {
                let mut hex = TokenDigest::of(raw).0;
                hex.truncate(FINGERPRINT_HEX_LEN);
                Self(hex)
            }
        }
    }

    /// Fingerprint from an already-known value (e.g. a jti)
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// String form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full SHA-256 of a raw token, used as the validation cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenDigest(String);

impl TokenDigest {
    /// Digest of `raw`
    #[must_use]
    pub fn of(raw: &str) -> Self {
        Self(hex::encode(Sha256::digest(raw.as_bytes())))
    }

    /// Hex form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result of a successful verification, whichever verifier produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    /// Resolved identity
    pub identity: Identity,
    /// Revocation key
    pub fingerprint: Fingerprint,
    /// `iat` (seconds)
    pub issued_at: u64,
    /// `exp` (seconds)
    pub expires_at: u64,
}

impl VerifiedToken {
    /// Build from verified claims
    #[must_use]
    pub fn from_claims(raw: &str, claims: &Claims) -> Self {
        Self {
            identity: Identity::from_claims(claims),
            fingerprint: claims.fingerprint(raw),
            issued_at: claims.iat,
            expires_at: claims.exp,
        }
    }

    /// Lifetime left at `now`; zero once expired
    #[must_use]
    pub fn remaining(&self, now: u64) -> Duration {
        Duration::from_secs(self.expires_at.saturating_sub(now))
    }
}

/// A freshly issued token
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    /// Encoded JWT
    pub token: String,
    /// Token id
    pub jti: String,
    /// `iat` (seconds)
    pub issued_at: u64,
    /// `exp` (seconds)
    pub expires_at: u64,
}

#[derive(Debug, Default, Deserialize)]
struct PeekClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    iat: Option<u64>,
}

/// Header and routing claims read without verifying the signature.
///
/// Nothing here is trusted; it only decides which verifier to use.
#[derive(Debug, Clone)]
pub struct UnverifiedToken {
    /// Header algorithm
    pub algorithm: Algorithm,
    /// Header key id
    pub kid: Option<String>,
    /// Payload issuer
    pub iss: Option<String>,
    /// Payload token id
    pub jti: Option<String>,
    /// Payload expiry
    pub exp: Option<u64>,
    /// Payload issued-at
    pub iat: Option<u64>,
}

impl UnverifiedToken {
    /// Parse the header and payload segments of `raw`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = raw.split('.');
        let (Some(_), Some(payload), Some(_), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(Error::Malformed("expected three segments".into()));
        };

        let header = jsonwebtoken::decode_header(raw)
            .map_err(|e| Error::Malformed(format!("header: {e}")))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| Error::Malformed(format!("payload encoding: {e}")))?;
        let peek: PeekClaims = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Malformed(format!("payload: {e}")))?;

        Ok(Self {
            algorithm: header.alg,
            kid: header.kid,
            iss: peek.iss,
            jti: peek.jti,
            exp: peek.exp,
            iat: peek.iat,
        })
    }
}

/// Anything that turns a raw token into a [`VerifiedToken`]
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `raw` completely (signature, issuer, lifetime)
    async fn verify(&self, raw: &str) -> Result<VerifiedToken>;
}
