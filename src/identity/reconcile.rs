//! Maps verified external identities onto local user records.
//!
//! The stored record stays authoritative for everything the provider does not
//! own: names, phone, notes, and above all the admin flag. Email and picture
//! follow the provider until the user edits their own profile.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::error::{AuthError, StoreError};
use super::model::{UserRecord, VerifiedExternalIdentity};
use super::store::RecordStore;

pub struct IdentityReconciler {
    store: Arc<dyn RecordStore>,
}

/// Split a provider display name into first and last name on the first
/// whitespace run.
fn split_display_name(display_name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(name) = display_name.map(str::trim).filter(|name| !name.is_empty()) else {
        return (None, None);
    };
    match name.split_once(char::is_whitespace) {
        Some((first, rest)) => {
            let rest = rest.trim();
            (
                Some(first.to_string()),
                (!rest.is_empty()).then(|| rest.to_string()),
            )
        }
        None => (Some(name.to_string()), None),
    }
}

impl IdentityReconciler {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Return the local record for `identity`, creating it on first sight.
    ///
    /// # Errors
    /// `IdentityConflict` when the asserted email belongs to another record;
    /// store failures otherwise.
    #[instrument(skip_all, fields(subject = %identity.subject))]
    pub async fn reconcile(
        &self,
        identity: &VerifiedExternalIdentity,
    ) -> Result<UserRecord, AuthError> {
        if let Some(stored) = self.store.get_user(&identity.subject).await? {
            return Ok(self.refresh(stored, identity).await);
        }

        let now = Utc::now();
        let mut record = UserRecord::new(&identity.subject, &identity.email, now);
        let (first_name, last_name) = split_display_name(identity.display_name.as_deref());
        record.first_name = first_name;
        record.last_name = last_name;
        record.profile_image_url.clone_from(&identity.picture);

        match self.store.insert_user(&record).await {
            Ok(()) => {
                info!("created local profile for external identity");
                Ok(record)
            }
            Err(StoreError::Conflict("id")) => {
                // Lost a race with a concurrent first request for this subject.
                self.store
                    .get_user(&identity.subject)
                    .await?
                    .ok_or_else(|| {
                        AuthError::Internal("user vanished after id conflict".to_string())
                    })
            }
            Err(StoreError::Conflict(column)) => {
                warn!(column, "external identity collides with an existing account");
                Err(AuthError::IdentityConflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Pull provider-owned fields into an existing record. Failures are
    /// logged and the stored record is returned unchanged.
    async fn refresh(&self, stored: UserRecord, identity: &VerifiedExternalIdentity) -> UserRecord {
        if stored.profile_edited {
            return stored;
        }

        let email_changed = stored.email != identity.email;
        let picture_changed =
            identity.picture.is_some() && stored.profile_image_url != identity.picture;
        if !email_changed && !picture_changed {
            return stored;
        }

        let refreshed = self
            .store
            .refresh_external_profile(&stored.id, &identity.email, identity.picture.as_deref())
            .await;
        match refreshed {
            Ok(Some(updated)) => updated,
            // Edited since it was read; the edit wins.
            Ok(None) => match self.store.get_user(&stored.id).await {
                Ok(Some(current)) => current,
                Ok(None) => stored,
                Err(err) => {
                    warn!(error = %err, "failed to re-read profile after skipped refresh");
                    stored
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to refresh profile from external identity");
                stored
            }
        }
    }
}
