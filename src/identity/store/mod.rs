//! Record store capability consumed by the identity authority.
//!
//! The authority never locks in-process: every operation below is a single
//! statement whose atomicity is provided by the backend.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::StoreError;
use super::model::{AuditEntry, AuditRecord, SessionRecord, UserRecord};

/// Self-service profile columns. An outer `None` leaves the column alone,
/// `Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub first_name: Option<Option<String>>,
    pub last_name: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub email: Option<String>,
}

impl ProfileUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user; fails with `StoreError::Conflict` on a duplicate
    /// id, username or email.
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    /// Write the columns named in `update` and mark the profile as edited.
    ///
    /// Returns the record as stored after the write, or `None` when the user
    /// does not exist.
    async fn update_profile(
        &self,
        id: &str,
        update: &ProfileUpdate,
    ) -> Result<Option<UserRecord>, StoreError>;

    /// Copy provider-owned columns onto a record the user has not edited.
    ///
    /// A `picture` of `None` keeps the stored image. Returns `None` when the
    /// user does not exist or `profile_edited` is already set.
    async fn refresh_external_profile(
        &self,
        id: &str,
        email: &str,
        picture: Option<&str>,
    ) -> Result<Option<UserRecord>, StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn find_user_by_username(&self, username: &str)
    -> Result<Option<UserRecord>, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    /// The only write path for the admin flag. Returns `false` when the
    /// user does not exist.
    async fn set_admin(&self, id: &str, is_admin: bool) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Fails with `StoreError::Conflict` when the hash already exists.
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn get_session(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete_session(&self, token_hash: &[u8]) -> Result<bool, StoreError>;

    /// Remove every session that expired at or before `now`.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait AuditStorage: Send + Sync {
    async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;

    /// Newest first, joined with the actor projection, plus the total count.
    async fn list_audit(&self, limit: u32, offset: u64)
    -> Result<(Vec<AuditEntry>, u64), StoreError>;

    /// Delete the given ids and return how many existed.
    async fn delete_audit(&self, ids: &[Uuid]) -> Result<u64, StoreError>;
}

/// Everything the authority needs from persistence.
#[async_trait]
pub trait RecordStore: UserStore + SessionStorage + AuditStorage {
    /// Cheap connectivity probe for `/health`.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Store backends selectable at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}
