//! Error taxonomy for identity resolution, authorization, and auditing.
//!
//! Every variant maps to exactly one HTTP status. Messages returned to clients
//! are deliberately generic: a failed login never reveals whether the account
//! exists, and an expired session looks the same as a missing one.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use super::token::TokenError;

/// Failures raised by the record store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint was violated; the payload names the column.
    #[error("unique constraint violated on {0}")]
    Conflict(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// A stored password hash could not be split into salt and key.
    #[error("stored credential has an invalid format")]
    InvalidCredentialFormat,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),
    #[error("authentication required")]
    Unauthorized,
    #[error("admin access required")]
    Forbidden,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("username already taken")]
    UsernameTaken,
    #[error("email already registered")]
    EmailTaken,
    /// An external identity asserted an email owned by another account.
    #[error("external identity conflicts with an existing account")]
    IdentityConflict,
    #[error("not found")]
    NotFound,
    #[error("failed to write audit record: {0}")]
    AuditWriteFailure(#[source] StoreError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::InvalidToken(_) | Self::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::UsernameTaken | Self::EmailTaken | Self::IdentityConflict => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidCredentialFormat
            | Self::AuditWriteFailure(_)
            | Self::Store(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid credentials",
            Self::InvalidToken(_) | Self::Unauthorized => "please re-authenticate",
            Self::Forbidden => "admin access required",
            Self::InvalidInput(message) => *message,
            Self::UsernameTaken => "username already taken",
            Self::EmailTaken => "email already registered",
            Self::IdentityConflict => "account conflict",
            Self::NotFound => "not found",
            Self::InvalidCredentialFormat
            | Self::AuditWriteFailure(_)
            | Self::Store(_)
            | Self::Internal(_) => "internal error",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}
