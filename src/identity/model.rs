//! Records owned by the identity authority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// One local account.
///
/// Under local trust mode `id` is a generated UUID and `password_hash` is set.
/// Under external trust mode `id` is the identity provider's subject and
/// `password_hash` is absent.
#[derive(Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct UserRecord {
    pub id: String,
    pub username: Option<String>,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub profile_image_url: Option<String>,
    pub is_admin: bool,
    #[serde(skip)]
    pub password_hash: Option<String>,
    /// Set once the user edits their own profile; external assertions stop
    /// overwriting email and picture from then on.
    pub profile_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// Build a fresh non-admin record with the given id and email.
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            username: None,
            email: email.into(),
            first_name: None,
            last_name: None,
            phone: None,
            notes: None,
            profile_image_url: None,
            is_admin: false,
            password_hash: None,
            profile_edited: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(name), None) | (None, Some(name)) => name.to_string(),
            (None, None) => self
                .username
                .clone()
                .unwrap_or_else(|| self.email.clone()),
        }
    }

    #[must_use]
    pub fn actor_summary(&self) -> ActorSummary {
        ActorSummary {
            id: self.id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
        }
    }
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("is_admin", &self.is_admin)
            .field(
                "password_hash",
                &self.password_hash.as_ref().map(|_| "***"),
            )
            .field("profile_edited", &self.profile_edited)
            .finish_non_exhaustive()
    }
}

/// Server-side session; only the SHA-256 of the cookie value is kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub token_hash: Vec<u8>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Identity asserted by a verified external token. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedExternalIdentity {
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
    pub picture: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Closed vocabulary of privileged actions written to the audit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BookingCreated,
    BookingUpdated,
    BookingDeleted,
    MessageDeleted,
    ProfileUpdated,
    UserAdminGranted,
    UserAdminRevoked,
    AuditLogsDeleted,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BookingCreated => "booking_created",
            Self::BookingUpdated => "booking_updated",
            Self::BookingDeleted => "booking_deleted",
            Self::MessageDeleted => "message_deleted",
            Self::ProfileUpdated => "profile_updated",
            Self::UserAdminGranted => "user_admin_granted",
            Self::UserAdminRevoked => "user_admin_revoked",
            Self::AuditLogsDeleted => "audit_logs_deleted",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "booking_created" => Ok(Self::BookingCreated),
            "booking_updated" => Ok(Self::BookingUpdated),
            "booking_deleted" => Ok(Self::BookingDeleted),
            "message_deleted" => Ok(Self::MessageDeleted),
            "profile_updated" => Ok(Self::ProfileUpdated),
            "user_admin_granted" => Ok(Self::UserAdminGranted),
            "user_admin_revoked" => Ok(Self::UserAdminRevoked),
            "audit_logs_deleted" => Ok(Self::AuditLogsDeleted),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

/// Immutable record of one privileged action.
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
pub struct AuditRecord {
    pub id: Uuid,
    pub user_id: String,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    #[schema(value_type = Object)]
    pub details: Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Minimal projection of the acting user shown next to audit entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct ActorSummary {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
}

/// Audit record joined with its actor, as served to the log viewer.
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
pub struct AuditEntry {
    #[serde(flatten)]
    pub record: AuditRecord,
    pub actor: Option<ActorSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_action_round_trips_through_strings() {
        for action in [
            AuditAction::BookingDeleted,
            AuditAction::ProfileUpdated,
            AuditAction::AuditLogsDeleted,
        ] {
            assert_eq!(action.as_str().parse::<AuditAction>(), Ok(action));
        }
        assert!("drop_tables".parse::<AuditAction>().is_err());
    }

    #[test]
    fn audit_action_serializes_snake_case() -> serde_json::Result<()> {
        let json = serde_json::to_string(&AuditAction::BookingDeleted)?;
        assert_eq!(json, "\"booking_deleted\"");
        Ok(())
    }

    #[test]
    fn user_debug_and_json_hide_password_hash() -> serde_json::Result<()> {
        let mut user = UserRecord::new("u1", "alice@example.com", Utc::now());
        user.password_hash = Some("c2VjcmV0".to_string());

        let debug = format!("{user:?}");
        assert!(!debug.contains("c2VjcmV0"));

        let json = serde_json::to_value(&user)?;
        assert!(json.get("password_hash").is_none());
        Ok(())
    }

    #[test]
    fn display_name_falls_back_to_username_then_email() {
        let mut user = UserRecord::new("u1", "alice@example.com", Utc::now());
        assert_eq!(user.display_name(), "alice@example.com");
        user.username = Some("alice".to_string());
        assert_eq!(user.display_name(), "alice");
        user.first_name = Some("Alice".to_string());
        user.last_name = Some("Liddell".to_string());
        assert_eq!(user.display_name(), "Alice Liddell");
    }

    #[test]
    fn session_expiry_is_inclusive_of_the_deadline() {
        let now = Utc::now();
        let session = SessionRecord {
            token_hash: vec![1],
            user_id: "u1".to_string(),
            created_at: now,
            expires_at: now,
        };
        assert!(session.is_expired_at(now));
        assert!(!session.is_expired_at(now - chrono::Duration::seconds(1)));
    }
}
