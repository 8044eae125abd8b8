//! PostgreSQL record store (`sql/schema.sql`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

use super::{AuditStorage, ProfileUpdate, RecordStore, SessionStorage, UserStore};
use crate::identity::error::StoreError;
use crate::identity::model::{
    ActorSummary, AuditAction, AuditEntry, AuditRecord, SessionRecord, UserRecord,
};

const USER_COLUMNS: &str = r"
    id, username, email, first_name, last_name, phone, notes, profile_image_url,
    is_admin, password_hash, profile_edited, created_at, updated_at
";

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_span(operation: &'static str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

/// Map a unique violation (SQLSTATE 23505) to the column it guards.
fn map_write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().is_some_and(|code| code.as_ref() == "23505") {
            let column = match db_err.constraint() {
                Some("users_email_key") => "email",
                Some("users_username_key") => "username",
                Some("user_sessions_pkey") => "session_hash",
                _ => "id",
            };
            return StoreError::Conflict(column);
        }
    }
    StoreError::Database(err)
}

fn user_from_row(row: &PgRow) -> Result<UserRecord, sqlx::Error> {
    Ok(UserRecord {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        phone: row.try_get("phone")?,
        notes: row.try_get("notes")?,
        profile_image_url: row.try_get("profile_image_url")?,
        is_admin: row.try_get("is_admin")?,
        password_hash: row.try_get("password_hash")?,
        profile_edited: row.try_get("profile_edited")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<SessionRecord, sqlx::Error> {
    Ok(SessionRecord {
        token_hash: row.try_get("session_hash")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn audit_entry_from_row(row: &PgRow) -> Result<AuditEntry, StoreError> {
    let action: String = row.try_get("action")?;
    let action = action
        .parse::<AuditAction>()
        .map_err(StoreError::Corrupt)?;
    let record = AuditRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        action,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        details: row.try_get("details")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        created_at: row.try_get("created_at")?,
    };
    let actor_id: Option<String> = row.try_get("actor_id")?;
    let actor = match actor_id {
        Some(id) => Some(ActorSummary {
            id,
            first_name: row.try_get("actor_first_name")?,
            last_name: row.try_get("actor_last_name")?,
            email: row.try_get("actor_email")?,
        }),
        None => None,
    };
    Ok(AuditEntry { record, actor })
}

async fn fetch_user_by(
    pool: &PgPool,
    column: &'static str,
    value: &str,
) -> Result<Option<UserRecord>, StoreError> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1 LIMIT 1");
    let row = sqlx::query(&query)
        .bind(value)
        .fetch_optional(pool)
        .instrument(db_span("SELECT", &query))
        .await?;
    Ok(row.as_ref().map(user_from_row).transpose()?)
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO users
                (id, username, email, first_name, last_name, phone, notes, profile_image_url,
                 is_admin, password_hash, profile_edited, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ";
        sqlx::query(query)
            .bind(&user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.phone)
            .bind(&user.notes)
            .bind(&user.profile_image_url)
            .bind(user.is_admin)
            .bind(&user.password_hash)
            .bind(user.profile_edited)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn update_profile(
        &self,
        id: &str,
        update: &ProfileUpdate,
    ) -> Result<Option<UserRecord>, StoreError> {
        // Each flag selects whether its column is written; absent fields keep
        // whatever a concurrent writer stored.
        let query = format!(
            r"
            UPDATE users
            SET first_name = CASE WHEN $2 THEN $3 ELSE first_name END,
                last_name = CASE WHEN $4 THEN $5 ELSE last_name END,
                phone = CASE WHEN $6 THEN $7 ELSE phone END,
                notes = CASE WHEN $8 THEN $9 ELSE notes END,
                email = COALESCE($10, email),
                profile_edited = TRUE,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
        "
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(update.first_name.is_some())
            .bind(update.first_name.clone().flatten())
            .bind(update.last_name.is_some())
            .bind(update.last_name.clone().flatten())
            .bind(update.phone.is_some())
            .bind(update.phone.clone().flatten())
            .bind(update.notes.is_some())
            .bind(update.notes.clone().flatten())
            .bind(update.email.as_deref())
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .map_err(map_write_error)?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn refresh_external_profile(
        &self,
        id: &str,
        email: &str,
        picture: Option<&str>,
    ) -> Result<Option<UserRecord>, StoreError> {
        let query = format!(
            r"
            UPDATE users
            SET email = $2,
                profile_image_url = COALESCE($3, profile_image_url),
                updated_at = NOW()
            WHERE id = $1 AND profile_edited = FALSE
            RETURNING {USER_COLUMNS}
        "
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(email)
            .bind(picture)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .map_err(map_write_error)?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        fetch_user_by(&self.pool, "id", id).await
    }

    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        fetch_user_by(&self.pool, "username", username).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        fetch_user_by(&self.pool, "email", email).await
    }

    async fn set_admin(&self, id: &str, is_admin: bool) -> Result<bool, StoreError> {
        let query = "UPDATE users SET is_admin = $2, updated_at = NOW() WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(is_admin)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SessionStorage for PgStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO user_sessions (session_hash, user_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(&session.token_hash)
            .bind(&session.user_id)
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn get_session(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError> {
        // Expiry is checked by the caller; rows may outlive their deadline
        // until the sweeper runs.
        let query = r"
            SELECT session_hash, user_id, created_at, expires_at
            FROM user_sessions
            WHERE session_hash = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn delete_session(&self, token_hash: &[u8]) -> Result<bool, StoreError> {
        let query = "DELETE FROM user_sessions WHERE session_hash = $1";
        let result = sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM user_sessions WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditStorage for PgStore {
    async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO audit_log
                (id, user_id, action, entity_type, entity_id, details, ip, user_agent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        sqlx::query(query)
            .bind(record.id)
            .bind(&record.user_id)
            .bind(record.action.as_str())
            .bind(&record.entity_type)
            .bind(&record.entity_id)
            .bind(&record.details)
            .bind(&record.ip)
            .bind(&record.user_agent)
            .bind(record.created_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn list_audit(
        &self,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<AuditEntry>, u64), StoreError> {
        let query = r"
            SELECT
                a.id, a.user_id, a.action, a.entity_type, a.entity_id, a.details,
                a.ip, a.user_agent, a.created_at,
                u.id AS actor_id,
                u.first_name AS actor_first_name,
                u.last_name AS actor_last_name,
                u.email AS actor_email
            FROM audit_log a
            LEFT JOIN users u ON u.id = a.user_id
            ORDER BY a.created_at DESC, a.id DESC
            LIMIT $1 OFFSET $2
        ";
        let rows = sqlx::query(query)
            .bind(i64::from(limit))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        let entries = rows
            .iter()
            .map(audit_entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let count_query = "SELECT COUNT(*) AS count FROM audit_log";
        let row = sqlx::query(count_query)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", count_query))
            .await?;
        let total: i64 = row.try_get("count")?;

        Ok((entries, u64::try_from(total).unwrap_or(0)))
    }

    async fn delete_audit(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let query = "DELETE FROM audit_log WHERE id = ANY($1)";
        let result = sqlx::query(query)
            .bind(ids)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(())
    }
}
