//! # Tripgate (Identity & Authorization Authority)
//!
//! `tripgate` decides who is calling and whether they may perform privileged
//! actions. It runs in exactly one of two trust modes, chosen at startup:
//!
//! - **Local:** accounts hold an Argon2id password hash. Logging in issues an
//!   opaque session token; only its SHA-256 digest is stored server-side.
//! - **External:** an identity provider issues RS256 ID tokens. Each request
//!   carries one as a bearer token, verified against the provider's JWKS, and
//!   the asserted identity is reconciled onto a local user record.
//!
//! ## Authorization
//!
//! Admin rights come only from the persisted `is_admin` flag. Role-like
//! claims inside a token are ignored. Any resolution failure fails closed to
//! an anonymous caller, and every failure renders as a generic 401.
//!
//! ## Audit
//!
//! Privileged mutations append an immutable audit record after they succeed.
//! Admins can page through the log and bulk-delete entries; the deletion is
//! itself audited.

pub mod api;
pub mod cli;
pub mod identity;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
