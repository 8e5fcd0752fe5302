//! Verification of identity-provider tokens against JWKS keys

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::Validation;
use tracing::debug;

use crate::keys::KeyStore;
use crate::token::{Claims, TokenVerifier, UnverifiedToken, VerifiedToken};
use crate::{Error, Result};

/// Verifies RS*/PS* tokens issued by the identity provider
pub struct RemoteVerifier {
    keys: Arc<KeyStore>,
    issuer: String,
    audience: Option<String>,
    leeway: u64,
}

impl RemoteVerifier {
    /// Create a verifier
    #[must_use]
    pub fn new(
        keys: Arc<KeyStore>,
        issuer: impl Into<String>,
        audience: Option<String>,
        leeway: Duration,
    ) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            audience,
            leeway: leeway.as_secs(),
        }
    }

    /// Expected issuer
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Key store backing this verifier
    #[must_use]
    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Verify `raw` and return its claims.
    pub async fn verify_claims(&self, raw: &str) -> Result<Claims> {
        let unverified = UnverifiedToken::parse(raw)?;
        let Some(kid) = unverified.kid else {
            return Err(Error::Malformed("remote token has no kid".into()));
        };

        let key = self.keys.get_key(&kid).await?;
        if !key.algorithms.contains(&unverified.algorithm) {
            debug!(kid = %kid, alg = ?unverified.algorithm, "Algorithm not allowed for key");
            return Err(Error::InvalidSignature);
        }

        let mut validation = Validation::new(unverified.algorithm);
        validation.algorithms.clone_from(&key.algorithms);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        let data = jsonwebtoken::decode::<Claims>(raw, &key.decoding_key, &validation)?;
        data.claims.check_lifetime()?;
        if data.claims.iss.as_deref() != Some(self.issuer.as_str()) {
            return Err(Error::InvalidIssuer("issuer mismatch".into()));
        }
        Ok(data.claims)
    }
}

#[async_trait]
impl TokenVerifier for RemoteVerifier {
    async fn verify(&self, raw: &str) -> Result<VerifiedToken> {
        let claims = self.verify_claims(raw).await?;
        Ok(VerifiedToken::from_claims(raw, &claims))
    }
}
