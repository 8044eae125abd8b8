//! Administrator endpoints for user records.

use axum::{
    Json,
    extract::{Extension, Path},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;

use crate::api::{AppState, Meta, RequireAdmin};
use crate::identity::{AuthError, UserRecord};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AdminFlagRequest {
    pub is_admin: bool,
}

#[utoipa::path(
    get,
    path = "/v1/admin/users/{id}",
    params(("id" = String, Path, description = "User identifier")),
    responses(
        (status = 200, description = "User record.", body = UserRecord),
        (status = 401, description = "Missing or invalid credentials."),
        (status = 403, description = "Caller is not an admin."),
        (status = 404, description = "No such user."),
    ),
    tag = "admin"
)]
pub async fn get_user(
    state: Extension<Arc<AppState>>,
    _admin: RequireAdmin,
    Path(id): Path<String>,
) -> Result<Json<UserRecord>, AuthError> {
    Ok(Json(state.accounts.get_user(&id).await?))
}

#[utoipa::path(
    put,
    path = "/v1/admin/users/{id}/admin",
    params(("id" = String, Path, description = "User identifier")),
    request_body = AdminFlagRequest,
    responses(
        (status = 200, description = "Admin flag updated.", body = UserRecord),
        (status = 401, description = "Missing or invalid credentials."),
        (status = 403, description = "Caller is not an admin."),
        (status = 404, description = "No such user."),
    ),
    tag = "admin"
)]
#[instrument(skip_all, fields(target = %id))]
pub async fn set_admin(
    state: Extension<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    Meta(meta): Meta,
    Path(id): Path<String>,
    Json(request): Json<AdminFlagRequest>,
) -> Result<Json<UserRecord>, AuthError> {
    let user = state
        .accounts
        .set_admin(&admin, &id, request.is_admin, &meta)
        .await?;
    Ok(Json(user))
}
