//! In-process record store for tests and `--store memory` development runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AuditStorage, ProfileUpdate, RecordStore, SessionStorage, UserStore};
use crate::identity::error::StoreError;
use crate::identity::model::{AuditEntry, AuditRecord, SessionRecord, UserRecord};

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    sessions: HashMap<Vec<u8>, SessionRecord>,
    // Insertion order is the tiebreak for equal timestamps.
    audit: Vec<AuditRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn unique_violation(tables: &Tables, user: &UserRecord) -> Option<&'static str> {
    tables.users.values().find_map(|existing| {
        if existing.id == user.id {
            return None;
        }
        if existing.email == user.email {
            return Some("email");
        }
        match (&existing.username, &user.username) {
            (Some(a), Some(b)) if a == b => Some("username"),
            _ => None,
        }
    })
}

fn email_owned_by_other(tables: &Tables, id: &str, email: &str) -> bool {
    tables
        .users
        .values()
        .any(|existing| existing.id != id && existing.email == email)
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.users.contains_key(&user.id) {
            return Err(StoreError::Conflict("id"));
        }
        if let Some(column) = unique_violation(&tables, user) {
            return Err(StoreError::Conflict(column));
        }
        tables.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn update_profile(
        &self,
        id: &str,
        update: &ProfileUpdate,
    ) -> Result<Option<UserRecord>, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(id) {
            return Ok(None);
        }
        if let Some(email) = &update.email {
            if email_owned_by_other(&tables, id, email) {
                return Err(StoreError::Conflict("email"));
            }
        }
        let Some(user) = tables.users.get_mut(id) else {
            return Ok(None);
        };
        if let Some(first_name) = &update.first_name {
            user.first_name.clone_from(first_name);
        }
        if let Some(last_name) = &update.last_name {
            user.last_name.clone_from(last_name);
        }
        if let Some(phone) = &update.phone {
            user.phone.clone_from(phone);
        }
        if let Some(notes) = &update.notes {
            user.notes.clone_from(notes);
        }
        if let Some(email) = &update.email {
            user.email.clone_from(email);
        }
        user.profile_edited = true;
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn refresh_external_profile(
        &self,
        id: &str,
        email: &str,
        picture: Option<&str>,
    ) -> Result<Option<UserRecord>, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.users.get(id) {
            Some(user) if !user.profile_edited => {}
            _ => return Ok(None),
        }
        if email_owned_by_other(&tables, id, email) {
            return Err(StoreError::Conflict("email"));
        }
        let Some(user) = tables.users.get_mut(id) else {
            return Ok(None);
        };
        email.clone_into(&mut user.email);
        if let Some(picture) = picture {
            user.profile_image_url = Some(picture.to_string());
        }
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.tables.read().await.users.get(id).cloned())
    }

    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|user| user.username.as_deref() == Some(username))
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn set_admin(&self, id: &str, is_admin: bool) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.users.get_mut(id) {
            Some(user) => {
                user.is_admin = is_admin;
                user.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl SessionStorage for MemoryStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.token_hash) {
            return Err(StoreError::Conflict("session_hash"));
        }
        tables
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.tables.read().await.sessions.get(token_hash).cloned())
    }

    async fn delete_session(&self, token_hash: &[u8]) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .write()
            .await
            .sessions
            .remove(token_hash)
            .is_some())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, session| !session.is_expired_at(now));
        Ok((before - tables.sessions.len()) as u64)
    }
}

#[async_trait]
impl AuditStorage for MemoryStore {
    async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.audit.iter().any(|existing| existing.id == record.id) {
            return Err(StoreError::Conflict("id"));
        }
        tables.audit.push(record.clone());
        Ok(())
    }

    async fn list_audit(
        &self,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<AuditEntry>, u64), StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<&AuditRecord> = tables.audit.iter().rev().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = records.len() as u64;
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let entries = records
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .map(|record| AuditEntry {
                record: record.clone(),
                actor: tables
                    .users
                    .get(&record.user_id)
                    .map(UserRecord::actor_summary),
            })
            .collect();
        Ok((entries, total))
    }

    async fn delete_audit(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut tables = self.tables.write().await;
        let before = tables.audit.len();
        tables.audit.retain(|record| !ids.contains(&record.id));
        Ok((before - tables.audit.len()) as u64)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str, username: Option<&str>, email: &str) -> UserRecord {
        let mut user = UserRecord::new(id, email, Utc::now());
        user.username = username.map(str::to_string);
        user
    }

    #[tokio::test]
    async fn insert_user_enforces_unique_columns() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store
            .insert_user(&user("u1", Some("alice"), "alice@example.com"))
            .await?;

        let dup_id = store
            .insert_user(&user("u1", Some("other"), "other@example.com"))
            .await;
        assert!(matches!(dup_id, Err(StoreError::Conflict("id"))));

        let dup_username = store
            .insert_user(&user("u2", Some("alice"), "alice2@example.com"))
            .await;
        assert!(matches!(dup_username, Err(StoreError::Conflict("username"))));

        let dup_email = store
            .insert_user(&user("u3", None, "alice@example.com"))
            .await;
        assert!(matches!(dup_email, Err(StoreError::Conflict("email"))));
        Ok(())
    }

    #[tokio::test]
    async fn update_profile_writes_only_named_columns() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut record = user("u1", None, "a@example.com");
        record.notes = Some("vip".to_string());
        store.insert_user(&record).await?;
        assert!(store.set_admin("u1", true).await?);

        let update = ProfileUpdate {
            phone: Some(Some("555-0100".to_string())),
            ..ProfileUpdate::default()
        };
        let stored = store.update_profile("u1", &update).await?;
        let stored = stored.ok_or_else(|| StoreError::Corrupt("missing user".to_string()))?;

        assert!(stored.is_admin);
        assert!(stored.profile_edited);
        assert_eq!(stored.phone.as_deref(), Some("555-0100"));
        assert_eq!(stored.notes.as_deref(), Some("vip"));
        assert_eq!(stored.email, "a@example.com");

        assert!(store.update_profile("missing", &update).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn update_profile_rejects_an_email_owned_by_another_user() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.insert_user(&user("u1", None, "a@example.com")).await?;
        store.insert_user(&user("u2", None, "b@example.com")).await?;

        let update = ProfileUpdate {
            email: Some("b@example.com".to_string()),
            ..ProfileUpdate::default()
        };
        let result = store.update_profile("u1", &update).await;
        assert!(matches!(result, Err(StoreError::Conflict("email"))));
        Ok(())
    }

    #[tokio::test]
    async fn external_refresh_skips_edited_profiles() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.insert_user(&user("sub-1", None, "old@example.com")).await?;

        let refreshed = store
            .refresh_external_profile("sub-1", "new@example.com", None)
            .await?;
        assert_eq!(
            refreshed.map(|u| u.email),
            Some("new@example.com".to_string())
        );

        let update = ProfileUpdate {
            notes: Some(Some("keep me".to_string())),
            ..ProfileUpdate::default()
        };
        store.update_profile("sub-1", &update).await?;

        let skipped = store
            .refresh_external_profile("sub-1", "idp@example.com", Some("https://img.test/p.png"))
            .await?;
        assert!(skipped.is_none());
        let stored = store.get_user("sub-1").await?;
        assert_eq!(
            stored.as_ref().map(|u| u.email.as_str()),
            Some("new@example.com")
        );
        assert_eq!(stored.and_then(|u| u.profile_image_url), None);
        Ok(())
    }

    #[tokio::test]
    async fn list_audit_orders_ties_by_insertion() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for n in 0..3 {
            let record = AuditRecord {
                id: Uuid::now_v7(),
                user_id: "admin".to_string(),
                action: crate::identity::model::AuditAction::BookingDeleted,
                entity_type: "booking".to_string(),
                entity_id: Some(format!("b{n}")),
                details: json!({}),
                ip: None,
                user_agent: None,
                created_at: now,
            };
            ids.push(record.id);
            store.insert_audit(&record).await?;
        }

        let (entries, total) = store.list_audit(2, 0).await?;
        assert_eq!(total, 3);
        let listed: Vec<Uuid> = entries.iter().map(|entry| entry.record.id).collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);
        Ok(())
    }
}
