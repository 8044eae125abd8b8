//! Route handlers.
//!
//! Handlers receive shared state through `Extension<Arc<AppState>>` and the
//! caller through the guards in [`super::guard`]. Failures are `AuthError`s,
//! which render as `{"error": "..."}` with the mapped status.

pub mod admin;
pub mod audit;
pub mod auth;
pub mod health;
pub mod me;
