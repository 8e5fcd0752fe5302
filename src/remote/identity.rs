//! Client for the identity service, and the introspection verifier built on it

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::failsafe::{CircuitBreaker, CircuitState};
use crate::token::{Fingerprint, Identity, TokenVerifier, UnverifiedToken, VerifiedToken, now_secs};
use crate::{Error, Result};

/// Body of `POST /api/v1/auth/validate`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    /// Whether the identity service accepted the token
    pub valid: bool,
    /// User id
    #[serde(default)]
    pub user_id: Option<String>,
    /// Username
    #[serde(default)]
    pub username: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Granted authorities (roles)
    #[serde(default)]
    pub authorities: Vec<String>,
    /// Reason for rejection
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Identity service health as seen through its breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentityHealth {
    /// Responding
    Up,
    /// Failing often enough that the circuit is open
    Degraded,
    /// Not responding
    Down,
}

/// HTTP client for the identity service
pub struct IdentityClient {
    client: reqwest::Client,
    validate_url: Url,
    health_url: Url,
    validate_breaker: Arc<CircuitBreaker>,
    health_breaker: Arc<CircuitBreaker>,
}

impl IdentityClient {
    /// Client for the service rooted at `base`
    pub fn new(
        client: reqwest::Client,
        base: &Url,
        validate_breaker: Arc<CircuitBreaker>,
        health_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            validate_url: endpoint(base, "api/v1/auth/validate")?,
            health_url: endpoint(base, "health")?,
            validate_breaker,
            health_breaker,
        })
    }

    /// Ask the identity service whether `raw` is valid.
    ///
    /// A 4xx answer is a verdict, not an outage, and does not count against
    /// the breaker.
    pub async fn validate(&self, raw: &str) -> Result<ValidationResponse> {
        self.validate_breaker.call(self.post_validate(raw)).await
    }

    /// Check `GET /health`.
    pub async fn health(&self) -> IdentityHealth {
        match self.health_breaker.call(self.get_health()).await {
            Ok(()) => IdentityHealth::Up,
            Err(_) if self.health_breaker.state() == CircuitState::Open => IdentityHealth::Degraded,
            Err(e) => {
                warn!(error = %e, "Identity service health check failed");
                IdentityHealth::Down
            }
        }
    }

    async fn post_validate(&self, raw: &str) -> Result<ValidationResponse> {
        let response = self
            .client
            .post(self.validate_url.clone())
            .bearer_auth(raw)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::ServiceUnavailable(format!(
                "identity service returned {status}"
            )));
        }
        if status.is_client_error() {
            debug!(%status, "Identity service rejected token");
            let body = response
                .json::<ValidationResponse>()
                .await
                .unwrap_or_default();
            return Ok(ValidationResponse {
                valid: false,
                error_message: body
                    .error_message
                    .or_else(|| Some(format!("rejected with {status}"))),
                ..ValidationResponse::default()
            });
        }

        Ok(response.json::<ValidationResponse>().await?)
    }

    async fn get_health(&self) -> Result<()> {
        let response = self.client.get(self.health_url.clone()).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::ServiceUnavailable(format!(
                "health returned {}",
                response.status()
            )))
        }
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let joined = format!("{}/{path}", base.as_str().trim_end_matches('/'));
    Url::parse(&joined).map_err(|e| Error::Config(format!("invalid identity service url: {e}")))
}

/// Delegates verification of remote tokens to the identity service
pub struct IntrospectionVerifier {
    client: Arc<IdentityClient>,
    fallback_ttl: Duration,
}

impl IntrospectionVerifier {
    /// `fallback_ttl` bounds the lifetime of opaque tokens with no readable `exp`
    #[must_use]
    pub fn new(client: Arc<IdentityClient>, fallback_ttl: Duration) -> Self {
        Self {
            client,
            fallback_ttl,
        }
    }
}

#[async_trait]
impl TokenVerifier for IntrospectionVerifier {
    async fn verify(&self, raw: &str) -> Result<VerifiedToken> {
        let response = self.client.validate(raw).await?;
        if !response.valid {
            let reason = response.error_message.unwrap_or_default();
            return Err(if reason.to_ascii_lowercase().contains("expired") {
                Error::Expired
            } else {
                Error::InvalidSignature
            });
        }

        let user_id = response
            .user_id
            .clone()
            .or_else(|| response.username.clone())
            .ok_or_else(|| Error::Malformed("validation response has no user".into()))?;
        let identity = Identity {
            username: response.username.unwrap_or_else(|| user_id.clone()),
            user_id,
            email: response.email,
            roles: response.authorities,
        };

        let now = now_secs();
        let peek = UnverifiedToken::parse(raw).ok();
        let jti = peek.as_ref().and_then(|p| p.jti.clone());
        let issued_at = peek.as_ref().and_then(|p| p.iat).unwrap_or(now);
        let expires_at = peek
            .as_ref()
            .and_then(|p| p.exp)
            .unwrap_or(now + self.fallback_ttl.as_secs());
        if expires_at <= now {
            return Err(Error::Expired);
        }

        Ok(VerifiedToken {
            identity,
            fingerprint: Fingerprint::for_token(raw, jti.as_deref()),
            issued_at,
            expires_at,
        })
    }
}
