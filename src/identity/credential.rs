//! Password hashing and verification.
//!
//! Stored form: standard base64 of `salt || key`, where `salt` is 16 random
//! bytes and `key` is the 64-byte Argon2id output.
//!
//! Cost parameters are fixed: 19 456 KiB of memory, 2 passes, 1 lane. Changing
//! them invalidates every stored credential, since the stored form does not
//! carry them.

use argon2::{Algorithm, Argon2, Params, Version};
use base64ct::{Base64, Encoding};
use rand::{RngCore, rngs::OsRng};
use subtle::ConstantTimeEq;

use super::error::AuthError;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 64;

const MEMORY_COST_KIB: u32 = 19 * 1024;
const TIME_COST: u32 = 2;
const PARALLELISM: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: MEMORY_COST_KIB,
            iterations: TIME_COST,
            parallelism: PARALLELISM,
        }
    }
}

/// Salts, hashes and verifies passwords.
#[derive(Clone, Debug, Default)]
pub struct CredentialVault {
    params: KdfParams,
}

impl CredentialVault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_params(params: KdfParams) -> Self {
        Self { params }
    }

    /// Hash a password with a fresh random salt.
    ///
    /// # Errors
    /// Returns `AuthError::Internal` if the OS random source or the KDF fails.
    pub fn hash(&self, password: &str) -> Result<String, AuthError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|err| AuthError::Internal(format!("failed to generate salt: {err}")))?;

        let key = self.derive(password, &salt)?;

        let mut stored = Vec::with_capacity(SALT_LEN + KEY_LEN);
        stored.extend_from_slice(&salt);
        stored.extend_from_slice(&key);
        Ok(Base64::encode_string(&stored))
    }

    /// Check a password against a stored form.
    ///
    /// # Errors
    /// Returns `AuthError::InvalidCredentialFormat` when `stored` does not
    /// decode into a salt and a key.
    pub fn verify(&self, password: &str, stored: &str) -> Result<bool, AuthError> {
        let bytes =
            Base64::decode_vec(stored.trim()).map_err(|_| AuthError::InvalidCredentialFormat)?;
        if bytes.len() != SALT_LEN + KEY_LEN {
            return Err(AuthError::InvalidCredentialFormat);
        }
        let (salt, expected) = bytes.split_at(SALT_LEN);

        let actual = self.derive(password, salt)?;
        Ok(bool::from(actual.as_slice().ct_eq(expected)))
    }

    fn derive(&self, password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], AuthError> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|err| AuthError::Internal(format!("invalid kdf parameters: {err}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut key)
            .map_err(|err| AuthError::Internal(format!("key derivation failed: {err}")))?;
        Ok(key)
    }
}

#[cfg(test)]
pub(crate) fn fast_vault() -> CredentialVault {
    CredentialVault::with_params(KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    })
}
