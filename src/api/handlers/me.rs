//! Authenticated self-service endpoints.

use axum::{Json, extract::Extension};
use std::sync::Arc;

use crate::api::{AppState, Meta, RequireUser};
use crate::identity::{AuthError, ProfilePatch, UserRecord};

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "Return the authenticated user profile.", body = UserRecord),
        (status = 401, description = "Missing or invalid credentials."),
    ),
    tag = "me"
)]
pub async fn get_me(RequireUser(user): RequireUser) -> Json<UserRecord> {
    Json(user)
}

#[utoipa::path(
    patch,
    path = "/v1/me",
    request_body = ProfilePatch,
    responses(
        (status = 200, description = "Profile updated.", body = UserRecord),
        (status = 400, description = "Invalid update payload."),
        (status = 401, description = "Missing or invalid credentials."),
        (status = 409, description = "Email already registered."),
    ),
    tag = "me"
)]
pub async fn patch_me(
    state: Extension<Arc<AppState>>,
    RequireUser(user): RequireUser,
    Meta(meta): Meta,
    Json(patch): Json<ProfilePatch>,
) -> Result<Json<UserRecord>, AuthError> {
    let updated = state.accounts.update_profile(&user, patch, &meta).await?;
    Ok(Json(updated))
}
