//! Append-only trail of privileged actions.

use axum::http::{HeaderMap, header::USER_AGENT};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::AuthError;
use super::model::{AuditAction, AuditEntry, AuditRecord};
use super::store::RecordStore;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Where a request came from, as far as the audit log cares.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            ip: extract_client_ip(headers),
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        }
    }
}

/// Client IP from common proxy headers.
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// What happened, to which entity.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub details: Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(action: AuditAction, entity_type: impl Into<String>) -> Self {
        Self {
            action,
            entity_type: entity_type.into(),
            entity_id: None,
            details: Value::Object(Map::new()),
        }
    }

    #[must_use]
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

pub struct AuditRecorder {
    store: Arc<dyn RecordStore>,
}

impl AuditRecorder {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Persist one record. Call only after the audited mutation succeeded.
    ///
    /// # Errors
    /// `InvalidInput` for a blank actor or entity type, `AuditWriteFailure`
    /// when the store rejects the write.
    pub async fn record(
        &self,
        actor_id: &str,
        event: AuditEvent,
        meta: &RequestMeta,
    ) -> Result<AuditRecord, AuthError> {
        if actor_id.trim().is_empty() {
            return Err(AuthError::InvalidInput("audit actor is required"));
        }
        if event.entity_type.trim().is_empty() {
            return Err(AuthError::InvalidInput("audit entity type is required"));
        }

        let record = AuditRecord {
            id: Uuid::now_v7(),
            user_id: actor_id.to_string(),
            action: event.action,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            details: event.details,
            ip: meta.ip.clone(),
            user_agent: meta.user_agent.clone(),
            created_at: Utc::now(),
        };
        self.store
            .insert_audit(&record)
            .await
            .map_err(AuthError::AuditWriteFailure)?;

        info!(
            audit_id = %record.id,
            actor = %record.user_id,
            action = %record.action,
            entity_type = %record.entity_type,
            entity_id = ?record.entity_id,
            "audit record written"
        );
        Ok(record)
    }

    /// [`record`](Self::record) for handlers whose mutation already
    /// committed: a failed write is logged and swallowed.
    pub async fn record_or_log(
        &self,
        actor_id: &str,
        event: AuditEvent,
        meta: &RequestMeta,
    ) -> Option<AuditRecord> {
        let action = event.action;
        let entity_id = event.entity_id.clone();
        match self.record(actor_id, event, meta).await {
            Ok(record) => Some(record),
            Err(err) => {
                error!(
                    audit_write_failure = true,
                    actor = %actor_id,
                    action = %action,
                    entity_id = ?entity_id,
                    error = %err,
                    "failed to write audit record"
                );
                None
            }
        }
    }

    /// Newest first, limit clamped to `1..=200`, plus the total count.
    ///
    /// # Errors
    /// Store failures.
    pub async fn list(&self, limit: Option<u32>, offset: Option<u64>) -> Result<AuditPage, AuthError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0);
        let (entries, total) = self.store.list_audit(limit, offset).await?;
        Ok(AuditPage {
            entries,
            total,
            limit,
            offset,
        })
    }

    /// Delete the given records and return how many existed.
    ///
    /// # Errors
    /// Store failures.
    pub async fn bulk_delete(&self, ids: &[Uuid]) -> Result<u64, AuthError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut seen = HashSet::new();
        let unique: Vec<Uuid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        Ok(self.store.delete_audit(&unique).await?)
    }
}
