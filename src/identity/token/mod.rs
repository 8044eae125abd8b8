//! RS256 bearer tokens issued by the external identity provider.

mod jwks;
mod jwt;
mod verifier;

pub use jwks::{Jwk, Jwks};
pub use jwt::{Audience, ExternalClaims, TokenHeader, VerificationOptions, verify_rs256};
pub use verifier::{
    DependencyStatus, FIREBASE_JWKS_URL, TokenVerifier, firebase_issuer,
};

use rsa::errors::Error as RsaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("rsa error")]
    Rsa(#[from] RsaError),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("invalid issued-at")]
    InvalidIat,
    #[error("missing subject")]
    MissingSubject,
    #[error("missing email")]
    MissingEmail,
}
