//! Locally issued HMAC tokens

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::LocalTokenConfig;
use crate::token::{Claims, IssuedToken, Subject, TokenVerifier, VerifiedToken, now_secs};
use crate::{Error, Result};

/// Minimum secret length in bytes (256 bits)
pub const MIN_SECRET_BYTES: usize = 32;

/// Fragments that mark a secret as a placeholder left in a config file
const WEAK_SECRET_FRAGMENTS: &[&str] = &[
    "secret",
    "changeme",
    "change-me",
    "test",
    "password",
    "default",
    "example",
    "placeholder",
    "your-",
    "dummy",
];

/// Check a signing secret for presence, length and known placeholders.
pub fn validate_secret(secret: Option<&SecretString>) -> Result<()> {
    let Some(secret) = secret else {
        return Err(Error::Config("local.secret is not set".into()));
    };
    let value = secret.expose_secret();

    if value.len() < MIN_SECRET_BYTES {
        return Err(Error::Config(format!(
            "local.secret must be at least {MIN_SECRET_BYTES} bytes, got {}",
            value.len()
        )));
    }

    let lowered = value.to_ascii_lowercase();
    if let Some(fragment) = WEAK_SECRET_FRAGMENTS
        .iter()
        .find(|f| lowered.contains(*f))
    {
        return Err(Error::Config(format!(
            "local.secret looks like a placeholder (contains '{fragment}')"
        )));
    }

    Ok(())
}

/// Parse a local (HMAC) algorithm name.
pub fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name.to_ascii_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(Error::Config(format!(
            "local.algorithm must be HS256, HS384 or HS512, got '{other}'"
        ))),
    }
}

/// Issues and verifies tokens signed with the shared secret
pub struct LocalSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    access_ttl: Duration,
    leeway: u64,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .finish_non_exhaustive()
    }
}

impl LocalSigner {
    /// Build a signer, rejecting weak secrets.
    pub fn new(config: &LocalTokenConfig) -> Result<Self> {
        validate_secret(config.secret.as_ref())?;
        let algorithm = parse_algorithm(&config.algorithm)?;
        let bytes = config
            .secret
            .as_ref()
            .map(|s| s.expose_secret().as_bytes())
            .unwrap_or_default();

        Ok(Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            algorithm,
            issuer: config.issuer.clone(),
            access_ttl: config.access_token_ttl,
            leeway: config.leeway.as_secs(),
        })
    }

    /// Issuer stamped on local tokens
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Default access token lifetime
    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Issue a token for `subject` valid for `ttl`.
    pub fn issue(&self, subject: &Subject, ttl: Duration) -> Result<IssuedToken> {
        if ttl.as_secs() == 0 {
            return Err(Error::Config("token ttl must be at least one second".into()));
        }

        let now = now_secs();
        let jti = uuid::Uuid::new_v4().to_string();
        let claims = Claims {
            sub: subject.username.clone(),
            user_id: subject.user_id.clone(),
            email: subject.email.clone(),
            role: (!subject.roles.is_empty()).then(|| subject.roles.join(",")),
            roles: Vec::new(),
            iat: now,
            exp: now + ttl.as_secs(),
            nbf: None,
            iss: Some(self.issuer.clone()),
            jti: Some(jti.clone()),
        };

        let token = jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encoding failed: {e}")))?;
        debug!(sub = %claims.sub, jti = %jti, "Issued local token");

        Ok(IssuedToken {
            token,
            jti,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }

    /// Verify signature, issuer and lifetime of a local token.
    pub fn verify(&self, raw: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = jsonwebtoken::decode::<Claims>(raw, &self.decoding, &validation)?;
        data.claims.check_lifetime()?;
        if data.claims.iss.as_deref().is_some_and(|iss| iss != self.issuer) {
            return Err(Error::InvalidIssuer("not the local issuer".into()));
        }
        Ok(data.claims)
    }

    /// Reissue a still-valid token with a new lifetime and `jti`.
    pub fn refresh(&self, raw: &str) -> Result<IssuedToken> {
        let claims = match self.verify(raw) {
            Ok(claims) => claims,
            Err(Error::Expired) => return Err(Error::NotRefreshable),
            Err(e) => return Err(e),
        };

        let mut subject = Subject::new(claims.sub.clone());
        subject.user_id = claims.user_id.clone();
        subject.email = claims.email.clone();
        subject.roles = crate::token::Identity::from_claims(&claims).roles;
        self.issue(&subject, self.access_ttl)
    }
}

#[async_trait]
impl TokenVerifier for LocalSigner {
    async fn verify(&self, raw: &str) -> Result<VerifiedToken> {
        let claims = LocalSigner::verify(self, raw)?;
        Ok(VerifiedToken::from_claims(raw, &claims))
    }
}
