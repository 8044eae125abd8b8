//! Identity and authorization core.
//!
//! Leaf first: [`credential`] hashes passwords, [`session`] keeps server-side
//! sessions, [`token`] verifies provider tokens, [`reconcile`] maps them onto
//! local records, [`gate`] turns request credentials into an [`AuthContext`],
//! and [`audit`] records privileged actions.

pub mod accounts;
pub mod audit;
pub mod credential;
pub mod error;
pub mod gate;
pub mod model;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

pub use accounts::{Accounts, AdminSeed, NewAccount, ProfilePatch};
pub use audit::{AuditEvent, AuditPage, AuditRecorder, RequestMeta};
pub use credential::CredentialVault;
pub use error::{AuthError, StoreError};
pub use gate::{
    AuthContext, AuthorizationGate, ExternalTokenResolver, IdentityResolver,
    LocalSessionResolver, RequestCredentials, SESSION_COOKIE_NAME, TrustMode,
};
pub use model::{
    ActorSummary, AuditAction, AuditEntry, AuditRecord, SessionRecord, UserRecord,
    VerifiedExternalIdentity,
};
pub use reconcile::IdentityReconciler;
pub use session::SessionManager;
pub use store::{MemoryStore, PgStore, RecordStore, StoreKind};
pub use token::{TokenError, TokenVerifier};
