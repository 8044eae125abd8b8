//! Server-side sessions for local trust mode.
//!
//! Tokens are 32 random bytes, base64url encoded. The raw value only travels
//! back to the caller so it can be set as a cookie; the store keys sessions
//! by the token's SHA-256.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

use super::error::{AuthError, StoreError};
use super::model::{SessionRecord, UserRecord};
use super::store::RecordStore;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

const INSERT_ATTEMPTS: usize = 3;

/// Create a new session token. Only its hash is ever persisted.
///
/// # Errors
/// Returns `AuthError::Internal` if the OS random source fails.
pub fn generate_session_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::Internal(format!("failed to generate session token: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[must_use]
pub fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

pub struct SessionManager {
    store: Arc<dyn RecordStore>,
    ttl: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start a session for `user_id` and return the raw token.
    ///
    /// # Errors
    /// Fails when the store rejects the insert for any reason other than a
    /// hash collision, or after three consecutive collisions.
    pub async fn create(&self, user_id: &str) -> Result<String, AuthError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|err| AuthError::Internal(format!("session ttl out of range: {err}")))?;

        for _ in 0..INSERT_ATTEMPTS {
            let token = generate_session_token()?;
            let now = Utc::now();
            let record = SessionRecord {
                token_hash: hash_session_token(&token),
                user_id: user_id.to_string(),
                created_at: now,
                expires_at: now + ttl,
            };
            match self.store.insert_session(&record).await {
                Ok(()) => return Ok(token),
                Err(StoreError::Conflict(_)) => {
                    debug!("session token hash collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(AuthError::Internal(
            "failed to generate unique session token".to_string(),
        ))
    }

    /// Look up the user behind a session token.
    ///
    /// Missing, expired, and orphaned sessions all resolve to `None`.
    ///
    /// # Errors
    /// Only store failures are errors.
    pub async fn resolve(&self, token: &str) -> Result<Option<UserRecord>, AuthError> {
        if token.is_empty() {
            return Ok(None);
        }
        let token_hash = hash_session_token(token);
        let Some(session) = self.store.get_session(&token_hash).await? else {
            return Ok(None);
        };
        if session.is_expired_at(Utc::now()) {
            return Ok(None);
        }
        Ok(self.store.get_user(&session.user_id).await?)
    }

    /// Remove the session if it exists. Unknown tokens are not an error.
    ///
    /// # Errors
    /// Only store failures are errors.
    pub async fn destroy(&self, token: &str) -> Result<(), AuthError> {
        let token_hash = hash_session_token(token);
        self.store.delete_session(&token_hash).await?;
        Ok(())
    }

    /// Delete every expired session and return how many were removed.
    ///
    /// # Errors
    /// Only store failures are errors.
    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired_sessions(Utc::now()).await?)
    }
}

/// Spawn a background task that periodically deletes expired sessions.
pub fn spawn_session_sweeper(
    sessions: Arc<SessionManager>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(every).await;
            match sessions.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "purged expired sessions"),
                Err(err) => error!("session sweep failed: {err}"),
            }
        }
    })
}
