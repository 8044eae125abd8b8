//! Account lifecycle: local registration and login, profile edits, admin
//! flag changes, and first-run administrator seeding.

use chrono::Utc;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditRecorder, RequestMeta};
use super::credential::CredentialVault;
use super::error::{AuthError, StoreError};
use super::gate::TrustMode;
use super::model::{AuditAction, UserRecord};
use super::session::SessionManager;
use super::store::{ProfileUpdate, RecordStore};

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 1024;
const MAX_PROFILE_FIELD_LEN: usize = 256;
const MAX_NOTES_LEN: usize = 4096;

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

pub(crate) fn valid_username(username: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").is_ok_and(|regex| regex.is_match(username))
}

/// Blank strings clear a field.
fn clean_optional(value: Option<String>, max_len: usize) -> Result<Option<String>, AuthError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if v.is_empty() => Ok(None),
        Some(v) if v.chars().count() > max_len => Err(AuthError::InvalidInput("field too long")),
        other => Ok(other),
    }
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Fields a user may change on their own record. Absent fields are kept.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct ProfilePatch {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// First-run administrator.
///
/// Local trust mode seeds are `username:email:password`; external trust mode
/// seeds are `subject:email`.
#[derive(Clone)]
pub enum AdminSeed {
    Local {
        username: String,
        email: String,
        password: SecretString,
    },
    External {
        subject: String,
        email: String,
    },
}

impl fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local {
                username, email, ..
            } => f
                .debug_struct("Local")
                .field("username", username)
                .field("email", email)
                .finish_non_exhaustive(),
            Self::External { subject, email } => f
                .debug_struct("External")
                .field("subject", subject)
                .field("email", email)
                .finish(),
        }
    }
}

impl AdminSeed {
    /// Parse a seed for the given trust mode.
    ///
    /// # Errors
    /// Returns a message naming the expected shape when `raw` does not match.
    pub fn parse(raw: &str, mode: TrustMode) -> Result<Self, String> {
        match mode {
            TrustMode::Local => {
                let mut parts = raw.splitn(3, ':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(username), Some(email), Some(password))
                        if !username.trim().is_empty()
                            && !email.trim().is_empty()
                            && !password.is_empty() =>
                    {
                        Ok(Self::Local {
                            username: username.trim().to_string(),
                            email: normalize_email(email),
                            password: SecretString::from(password.to_string()),
                        })
                    }
                    _ => Err("local admin seed must be username:email:password".to_string()),
                }
            }
            TrustMode::External => match raw.split_once(':') {
                Some((subject, email))
                    if !subject.trim().is_empty() && !email.trim().is_empty() =>
                {
                    Ok(Self::External {
                        subject: subject.trim().to_string(),
                        email: normalize_email(email),
                    })
                }
                _ => Err("external admin seed must be subject:email".to_string()),
            },
        }
    }
}

pub struct Accounts {
    store: Arc<dyn RecordStore>,
    vault: CredentialVault,
    sessions: Arc<SessionManager>,
    audit: Arc<AuditRecorder>,
    /// Verified against when the username is unknown so both paths cost one KDF run.
    dummy_hash: String,
}

impl Accounts {
    /// # Errors
    /// Fails if the timing-equalization hash cannot be computed.
    pub fn new(
        store: Arc<dyn RecordStore>,
        vault: CredentialVault,
        sessions: Arc<SessionManager>,
        audit: Arc<AuditRecorder>,
    ) -> Result<Self, AuthError> {
        let dummy_hash = vault.hash("tripgate-dummy-password")?;
        Ok(Self {
            store,
            vault,
            sessions,
            audit,
            dummy_hash,
        })
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    async fn hash_password(&self, password: String) -> Result<String, AuthError> {
        let vault = self.vault.clone();
        tokio::task::spawn_blocking(move || vault.hash(&password))
            .await
            .map_err(|err| AuthError::Internal(format!("password hashing task failed: {err}")))?
    }

    async fn verify_password(&self, password: String, stored: String) -> Result<bool, AuthError> {
        let vault = self.vault.clone();
        tokio::task::spawn_blocking(move || vault.verify(&password, &stored))
            .await
            .map_err(|err| AuthError::Internal(format!("password check task failed: {err}")))?
    }

    /// Create a local account.
    ///
    /// # Errors
    /// `InvalidInput` on malformed fields, `UsernameTaken` / `EmailTaken` on
    /// conflicts.
    #[instrument(skip_all, fields(username = %account.username))]
    pub async fn register(&self, account: NewAccount) -> Result<UserRecord, AuthError> {
        let username = account.username.trim().to_string();
        if !valid_username(&username) {
            return Err(AuthError::InvalidInput(
                "username must be 3-32 characters of letters, digits, '_', '.' or '-'",
            ));
        }
        let email = normalize_email(&account.email);
        if !valid_email(&email) {
            return Err(AuthError::InvalidInput("invalid email address"));
        }
        let password_len = account.password.chars().count();
        if password_len < MIN_PASSWORD_LEN {
            return Err(AuthError::InvalidInput("password must be at least 8 characters"));
        }
        if password_len > MAX_PASSWORD_LEN {
            return Err(AuthError::InvalidInput("password too long"));
        }

        if self.store.find_user_by_username(&username).await?.is_some() {
            return Err(AuthError::UsernameTaken);
        }
        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let password_hash = self.hash_password(account.password).await?;
        let mut user = UserRecord::new(Uuid::new_v4().to_string(), email, Utc::now());
        user.username = Some(username);
        user.first_name = clean_optional(account.first_name, MAX_PROFILE_FIELD_LEN)?;
        user.last_name = clean_optional(account.last_name, MAX_PROFILE_FIELD_LEN)?;
        user.phone = clean_optional(account.phone, MAX_PROFILE_FIELD_LEN)?;
        user.password_hash = Some(password_hash);

        self.insert_new_user(&user).await?;
        info!(user_id = %user.id, "registered local account");
        Ok(user)
    }

    async fn insert_new_user(&self, user: &UserRecord) -> Result<(), AuthError> {
        match self.store.insert_user(user).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict("username")) => Err(AuthError::UsernameTaken),
            Err(StoreError::Conflict("email")) => Err(AuthError::EmailTaken),
            Err(err) => Err(err.into()),
        }
    }

    /// Check a username and password and open a session.
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown user, a wrong password, or an
    /// account without a password; the three are indistinguishable.
    #[instrument(skip_all, fields(username = %username))]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(UserRecord, String), AuthError> {
        let user = self.store.find_user_by_username(username.trim()).await?;
        let stored = user.as_ref().and_then(|user| user.password_hash.clone());

        let Some((user, stored)) = user.zip(stored) else {
            // Burn the same KDF cost as a real check.
            let _ = self
                .verify_password(password.to_string(), self.dummy_hash.clone())
                .await;
            return Err(AuthError::InvalidCredentials);
        };

        if !self.verify_password(password.to_string(), stored).await? {
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.sessions.create(&user.id).await?;
        info!(user_id = %user.id, "login succeeded");
        Ok((user, token))
    }

    /// End a session. Unknown tokens are ignored.
    ///
    /// # Errors
    /// Store failures.
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        self.sessions.destroy(token).await
    }

    /// # Errors
    /// `NotFound` when no such user exists.
    pub async fn get_user(&self, id: &str) -> Result<UserRecord, AuthError> {
        self.store.get_user(id).await?.ok_or(AuthError::NotFound)
    }

    /// Apply a self-service profile edit and audit it.
    ///
    /// The edit marks the profile as user-owned, so later external
    /// assertions no longer overwrite email or picture.
    ///
    /// # Errors
    /// `InvalidInput` on malformed fields, `EmailTaken` on an email conflict,
    /// `NotFound` if the user disappeared.
    #[instrument(skip_all, fields(user_id = %actor.id))]
    pub async fn update_profile(
        &self,
        actor: &UserRecord,
        patch: ProfilePatch,
        meta: &RequestMeta,
    ) -> Result<UserRecord, AuthError> {
        let current = self.get_user(&actor.id).await?;
        let mut update = ProfileUpdate::default();
        let mut changed = Vec::new();

        if let Some(first_name) = patch.first_name {
            update.first_name = Some(clean_optional(Some(first_name), MAX_PROFILE_FIELD_LEN)?);
            changed.push("first_name");
        }
        if let Some(last_name) = patch.last_name {
            update.last_name = Some(clean_optional(Some(last_name), MAX_PROFILE_FIELD_LEN)?);
            changed.push("last_name");
        }
        if let Some(phone) = patch.phone {
            update.phone = Some(clean_optional(Some(phone), MAX_PROFILE_FIELD_LEN)?);
            changed.push("phone");
        }
        if let Some(notes) = patch.notes {
            update.notes = Some(clean_optional(Some(notes), MAX_NOTES_LEN)?);
            changed.push("notes");
        }
        if let Some(email) = patch.email {
            let email = normalize_email(&email);
            if !valid_email(&email) {
                return Err(AuthError::InvalidInput("invalid email address"));
            }
            if email != current.email {
                update.email = Some(email);
                changed.push("email");
            }
        }

        if update.is_empty() {
            return Ok(current);
        }

        let user = match self.store.update_profile(&current.id, &update).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(AuthError::NotFound),
            Err(StoreError::Conflict("email")) => return Err(AuthError::EmailTaken),
            Err(err) => return Err(err.into()),
        };

        let event = AuditEvent::new(AuditAction::ProfileUpdated, "user")
            .with_entity_id(user.id.clone())
            .with_details(json!({ "fields": changed }));
        self.audit.record_or_log(&user.id, event, meta).await;
        Ok(user)
    }

    /// Grant or revoke admin rights. This is the only request-driven path
    /// that writes the flag.
    ///
    /// # Errors
    /// `Forbidden` unless `actor` is an admin, `NotFound` for an unknown target.
    #[instrument(skip_all, fields(actor = %actor.id, target = %target_id, is_admin))]
    pub async fn set_admin(
        &self,
        actor: &UserRecord,
        target_id: &str,
        is_admin: bool,
        meta: &RequestMeta,
    ) -> Result<UserRecord, AuthError> {
        if !actor.is_admin {
            return Err(AuthError::Forbidden);
        }
        if !self.store.set_admin(target_id, is_admin).await? {
            return Err(AuthError::NotFound);
        }
        let user = self.get_user(target_id).await?;

        let action = if is_admin {
            AuditAction::UserAdminGranted
        } else {
            AuditAction::UserAdminRevoked
        };
        let event = AuditEvent::new(action, "user")
            .with_entity_id(target_id)
            .with_details(json!({ "is_admin": is_admin, "email": user.email }));
        self.audit.record_or_log(&actor.id, event, meta).await;
        Ok(user)
    }

    /// Create missing seed administrators. Existing records are never
    /// modified. Returns how many accounts were created.
    ///
    /// # Errors
    /// Fails on the first seed that cannot be created.
    pub async fn bootstrap_admins(&self, seeds: &[AdminSeed]) -> Result<usize, AuthError> {
        let mut created = 0;
        for seed in seeds {
            match seed {
                AdminSeed::Local {
                    username,
                    email,
                    password,
                } => {
                    if self.store.find_user_by_username(username).await?.is_some() {
                        info!(%username, "seed admin already exists; leaving it untouched");
                        continue;
                    }
                    if !valid_username(username) || !valid_email(email) {
                        return Err(AuthError::InvalidInput("invalid admin seed"));
                    }
                    let password_hash =
                        self.hash_password(password.expose_secret().to_string()).await?;
                    let mut user =
                        UserRecord::new(Uuid::new_v4().to_string(), email.clone(), Utc::now());
                    user.username = Some(username.clone());
                    user.password_hash = Some(password_hash);
                    user.is_admin = true;
                    self.insert_new_user(&user).await?;
                    info!(user_id = %user.id, %username, "seeded local admin");
                }
                AdminSeed::External { subject, email } => {
                    if self.store.get_user(subject).await?.is_some() {
                        info!(%subject, "seed admin already exists; leaving it untouched");
                        continue;
                    }
                    if !valid_email(email) {
                        return Err(AuthError::InvalidInput("invalid admin seed"));
                    }
                    let mut user = UserRecord::new(subject.clone(), email.clone(), Utc::now());
                    user.is_admin = true;
                    match self.store.insert_user(&user).await {
                        Ok(()) => info!(%subject, "seeded external admin"),
                        Err(StoreError::Conflict("id")) => continue,
                        Err(StoreError::Conflict(_)) => {
                            warn!(%subject, %email, "seed admin email belongs to another account");
                            return Err(AuthError::EmailTaken);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            created += 1;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::credential::fast_vault;
    use crate::identity::session::DEFAULT_SESSION_TTL;
    use crate::identity::store::{MemoryStore, UserStore};
    use anyhow::Result;

    fn accounts() -> Result<(Accounts, Arc<MemoryStore>, Arc<AuditRecorder>)> {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(store.clone(), DEFAULT_SESSION_TTL));
        let audit = Arc::new(AuditRecorder::new(store.clone()));
        let accounts = Accounts::new(store.clone(), fast_vault(), sessions, audit.clone())?;
        Ok((accounts, store, audit))
    }

    fn alice() -> NewAccount {
        NewAccount {
            username: "alice".to_string(),
            email: "Alice@Example.com".to_string(),
            password: "pw123456".to_string(),
            first_name: Some("Alice".to_string()),
            last_name: None,
            phone: None,
        }
    }

    #[test]
    fn username_and_email_validation() {
        assert!(valid_username("alice"));
        assert!(valid_username("a.b-c_d"));
        assert!(!valid_username("al"));
        assert!(!valid_username("alice smith"));
        assert!(!valid_username(&"a".repeat(33)));
        assert!(valid_email("a@example.com"));
        assert!(!valid_email("missing-domain@"));
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn admin_seeds_parse_per_trust_mode() {
        let seed = AdminSeed::parse("root:Root@Example.com:pw:with:colons", TrustMode::Local);
        match seed {
            Ok(AdminSeed::Local {
                username,
                email,
                password,
            }) => {
                assert_eq!(username, "root");
                assert_eq!(email, "root@example.com");
                assert_eq!(password.expose_secret(), "pw:with:colons");
            }
            other => panic!("unexpected seed: {other:?}"),
        }
        assert!(AdminSeed::parse("root:root@example.com", TrustMode::Local).is_err());
        assert!(matches!(
            AdminSeed::parse("sub-1:root@example.com", TrustMode::External),
            Ok(AdminSeed::External { .. })
        ));
        assert!(AdminSeed::parse("sub-1", TrustMode::External).is_err());
    }

    #[test]
    fn seed_debug_hides_password() -> Result<()> {
        let seed = AdminSeed::parse("root:root@example.com:hunter22", TrustMode::Local)
            .map_err(anyhow::Error::msg)?;
        assert!(!format!("{seed:?}").contains("hunter22"));
        Ok(())
    }

    #[tokio::test]
    async fn register_login_and_resolve() -> Result<()> {
        let (accounts, _, _) = accounts()?;
        let user = accounts.register(alice()).await?;
        assert_eq!(user.email, "alice@example.com");
        assert!(!user.is_admin);

        let (logged_in, token) = accounts.login("alice", "pw123456").await?;
        assert_eq!(logged_in.id, user.id);

        let resolved = accounts.sessions().resolve(&token).await?;
        assert_eq!(resolved.map(|u| u.id), Some(user.id));

        accounts.logout(&token).await?;
        assert!(accounts.sessions().resolve(&token).await?.is_none());
        accounts.logout(&token).await?;
        Ok(())
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() -> Result<()> {
        let (accounts, store, _) = accounts()?;
        accounts.register(alice()).await?;
        let mut external = UserRecord::new("sub-1", "ext@example.com", Utc::now());
        external.username = Some("external".to_string());
        store.insert_user(&external).await?;

        for (username, password) in [
            ("alice", "wrong-password"),
            ("nobody", "pw123456"),
            ("external", "pw123456"),
        ] {
            let result = accounts.login(username, password).await;
            assert!(
                matches!(result, Err(AuthError::InvalidCredentials)),
                "{username} should fail with InvalidCredentials"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_bad_input_and_duplicates() -> Result<()> {
        let (accounts, _, _) = accounts()?;
        accounts.register(alice()).await?;

        let mut short = alice();
        short.username = "bob".to_string();
        short.email = "bob@example.com".to_string();
        short.password = "short".to_string();
        assert!(matches!(
            accounts.register(short).await,
            Err(AuthError::InvalidInput(_))
        ));

        let mut bad_email = alice();
        bad_email.username = "bob".to_string();
        bad_email.email = "not-an-email".to_string();
        assert!(matches!(
            accounts.register(bad_email).await,
            Err(AuthError::InvalidInput(_))
        ));

        let mut same_username = alice();
        same_username.email = "other@example.com".to_string();
        assert!(matches!(
            accounts.register(same_username).await,
            Err(AuthError::UsernameTaken)
        ));

        let mut same_email = alice();
        same_email.username = "alice2".to_string();
        assert!(matches!(
            accounts.register(same_email).await,
            Err(AuthError::EmailTaken)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn profile_updates_are_audited_and_mark_the_profile_edited() -> Result<()> {
        let (accounts, _, audit) = accounts()?;
        let user = accounts.register(alice()).await?;

        let patch = ProfilePatch {
            phone: Some("555-0100".to_string()),
            last_name: Some("  ".to_string()),
            ..ProfilePatch::default()
        };
        let updated = accounts
            .update_profile(&user, patch, &RequestMeta::default())
            .await?;
        assert_eq!(updated.phone.as_deref(), Some("555-0100"));
        assert!(updated.last_name.is_none());
        assert!(updated.profile_edited);
        assert!(!updated.is_admin);

        let page = audit.list(None, None).await?;
        let entry = page
            .entries
            .first()
            .ok_or_else(|| anyhow::anyhow!("no audit entry"))?;
        assert_eq!(entry.record.action, AuditAction::ProfileUpdated);
        assert_eq!(entry.record.user_id, user.id);
        Ok(())
    }

    #[tokio::test]
    async fn set_admin_requires_an_admin_actor_and_is_audited() -> Result<()> {
        let (accounts, store, audit) = accounts()?;
        let alice = accounts.register(alice()).await?;
        let mut admin = UserRecord::new("admin-1", "admin@example.com", Utc::now());
        admin.is_admin = true;
        store.insert_user(&admin).await?;

        assert!(matches!(
            accounts
                .set_admin(&alice, &alice.id, true, &RequestMeta::default())
                .await,
            Err(AuthError::Forbidden)
        ));
        assert!(matches!(
            accounts
                .set_admin(&admin, "missing", true, &RequestMeta::default())
                .await,
            Err(AuthError::NotFound)
        ));

        let promoted = accounts
            .set_admin(&admin, &alice.id, true, &RequestMeta::default())
            .await?;
        assert!(promoted.is_admin);

        let page = audit.list(None, None).await?;
        assert_eq!(
            page.entries.first().map(|e| e.record.action),
            Some(AuditAction::UserAdminGranted)
        );
        Ok(())
    }

    #[tokio::test]
    async fn bootstrap_creates_missing_admins_once() -> Result<()> {
        let (accounts, store, _) = accounts()?;
        let seeds = [AdminSeed::parse("root:root@example.com:rootpass1", TrustMode::Local)
            .map_err(anyhow::Error::msg)?];

        assert_eq!(accounts.bootstrap_admins(&seeds).await?, 1);
        assert_eq!(accounts.bootstrap_admins(&seeds).await?, 0);

        let root = store
            .find_user_by_username("root")
            .await?
            .ok_or_else(|| anyhow::anyhow!("seed missing"))?;
        assert!(root.is_admin);

        let (user, _) = accounts.login("root", "rootpass1").await?;
        assert!(user.is_admin);
        Ok(())
    }

    #[tokio::test]
    async fn bootstrap_leaves_existing_accounts_alone() -> Result<()> {
        let (accounts, store, _) = accounts()?;
        accounts.register(alice()).await?;
        let seeds = [AdminSeed::parse("alice:alice@example.com:another-pass", TrustMode::Local)
            .map_err(anyhow::Error::msg)?];
        assert_eq!(accounts.bootstrap_admins(&seeds).await?, 0);

        let alice = store
            .find_user_by_username("alice")
            .await?
            .ok_or_else(|| anyhow::anyhow!("alice missing"))?;
        assert!(!alice.is_admin);

        let seeds = [AdminSeed::parse("sub-1:ops@example.com", TrustMode::External)
            .map_err(anyhow::Error::msg)?];
        assert_eq!(accounts.bootstrap_admins(&seeds).await?, 1);
        assert_eq!(store.get_user("sub-1").await?.map(|u| u.is_admin), Some(true));
        Ok(())
    }
}
