//! Request guards backed by the `AuthContext` the auth middleware attaches.
//!
//! Both extractors reject before the handler body runs, so a handler that
//! takes `RequireAdmin` never executes for anyone else.

use axum::{
    extract::{FromRequestParts, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use std::ops::Deref;
use std::sync::Arc;

use super::AppState;
use crate::identity::{AuthContext, AuthError, RequestCredentials, RequestMeta, UserRecord};

/// Resolve the caller once per request and stash the result in extensions.
pub async fn attach_auth_context(
    axum::Extension(state): axum::Extension<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = RequestCredentials::from_headers(request.headers());
    let context = state.gate.authenticate(&credentials).await;
    let meta = RequestMeta::from_headers(request.headers());
    request.extensions_mut().insert(context);
    request.extensions_mut().insert(meta);
    next.run(request).await
}

fn auth_context(parts: &Parts) -> AuthContext {
    // Missing context means the middleware did not run; treat as anonymous.
    parts
        .extensions
        .get::<AuthContext>()
        .cloned()
        .unwrap_or_default()
}

/// Any authenticated caller.
#[derive(Clone, Debug)]
pub struct RequireUser(pub UserRecord);

impl Deref for RequireUser {
    type Target = UserRecord;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequireUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        auth_context(parts)
            .require_authenticated()
            .cloned()
            .map(RequireUser)
    }
}

/// An authenticated caller whose persisted record carries the admin flag.
#[derive(Clone, Debug)]
pub struct RequireAdmin(pub UserRecord);

impl Deref for RequireAdmin {
    type Target = UserRecord;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        auth_context(parts)
            .require_admin()
            .cloned()
            .map(RequireAdmin)
    }
}

/// Caller metadata for audit records.
#[derive(Clone, Debug, Default)]
pub struct Meta(pub RequestMeta);

impl<S> FromRequestParts<S> for Meta
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<RequestMeta>()
                .cloned()
                .unwrap_or_else(|| RequestMeta::from_headers(&parts.headers)),
        ))
    }
}
