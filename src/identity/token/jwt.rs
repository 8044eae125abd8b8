use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::DateTime;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::TokenError;
use super::jwks::Jwks;
use crate::identity::model::VerifiedExternalIdentity;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    pub kid: String,
}

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(value) => value == audience,
            Self::Many(values) => values.iter().any(|value| value == audience),
        }
    }
}

/// The subset of provider claims this crate reads. Anything else in the
/// payload, role or admin claims included, is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalClaims {
    pub iss: String,
    pub aud: Audience,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

impl ExternalClaims {
    /// Project validated claims onto the identity handed to the reconciler.
    ///
    /// # Errors
    /// Returns `MissingSubject` / `MissingEmail` when either is absent or blank.
    pub fn into_identity(self) -> Result<VerifiedExternalIdentity, TokenError> {
        let subject = self
            .sub
            .filter(|sub| !sub.trim().is_empty())
            .ok_or(TokenError::MissingSubject)?;
        let email = self
            .email
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty())
            .ok_or(TokenError::MissingEmail)?;
        let issued_at = DateTime::from_timestamp(self.iat, 0).ok_or(TokenError::InvalidIat)?;
        let expires_at = DateTime::from_timestamp(self.exp, 0).ok_or(TokenError::Expired)?;
        Ok(VerifiedExternalIdentity {
            subject,
            email,
            display_name: self.name.filter(|name| !name.trim().is_empty()),
            picture: self.picture.filter(|picture| !picture.trim().is_empty()),
            issued_at,
            expires_at,
        })
    }
}

/// Claim validation inputs for [`verify_rs256`].
#[derive(Debug, Clone, Copy)]
pub struct VerificationOptions<'a> {
    pub expected_issuer: &'a str,
    pub expected_audience: &'a str,
    pub now_unix_seconds: i64,
    /// Tolerated clock skew for `iat`.
    pub leeway_seconds: i64,
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Verify an RS256 JWT against a JWKS and return its claims.
///
/// # Errors
///
/// Returns an error if:
/// - the token is malformed or contains invalid base64/json,
/// - the algorithm is not RS256,
/// - the `kid` is unknown for the provided JWKS,
/// - the signature is invalid,
/// - the claims fail validation (`iss`, `aud`, `exp`, `iat`, `sub`, `email`).
pub fn verify_rs256(
    token: &str,
    jwks: &Jwks,
    options: &VerificationOptions<'_>,
) -> Result<ExternalClaims, TokenError> {
    let mut parts = token.trim().split('.');
    let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() || header_b64.is_empty() || claims_b64.is_empty() {
        return Err(TokenError::TokenFormat);
    }

    let header: TokenHeader = b64d_json(header_b64)?;
    if header.alg != "RS256" {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }

    let jwk = jwks
        .find_by_kid(&header.kid)
        .ok_or_else(|| TokenError::UnknownKid(header.kid.clone()))?;

    let public_key = jwk.to_rsa_public_key()?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| TokenError::InvalidSignature)?;
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims: ExternalClaims = b64d_json(claims_b64)?;
    if claims.iss != options.expected_issuer {
        return Err(TokenError::InvalidIssuer);
    }
    if !claims.aud.contains(options.expected_audience) {
        return Err(TokenError::InvalidAudience);
    }
    if claims.exp <= options.now_unix_seconds {
        return Err(TokenError::Expired);
    }
    if claims.iat > options.now_unix_seconds.saturating_add(options.leeway_seconds) {
        return Err(TokenError::InvalidIat);
    }
    if claims.sub.as_deref().is_none_or(|sub| sub.trim().is_empty()) {
        return Err(TokenError::MissingSubject);
    }
    if claims.email.as_deref().is_none_or(|email| email.trim().is_empty()) {
        return Err(TokenError::MissingEmail);
    }

    Ok(claims)
}
