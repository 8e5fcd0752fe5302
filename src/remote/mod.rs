//! Remote (identity provider) token verification

mod identity;
mod jwks;

pub use identity::{IdentityClient, IdentityHealth, IntrospectionVerifier, ValidationResponse};
pub use jwks::RemoteVerifier;
