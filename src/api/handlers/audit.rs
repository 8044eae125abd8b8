//! Audit log viewer endpoints.

use axum::{
    Json,
    extract::{Extension, Query},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::{AppState, Meta, RequireAdmin};
use crate::identity::{AuditAction, AuditEvent, AuditPage, AuthError};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditQuery {
    /// Page size, clamped to 1..=200. Defaults to 50.
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuditDeleteRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditDeleteResponse {
    /// How many of the requested records existed and were removed.
    pub deleted: u64,
}

#[utoipa::path(
    get,
    path = "/v1/admin/audit-logs",
    params(AuditQuery),
    responses(
        (status = 200, description = "Newest audit entries first.", body = AuditPage),
        (status = 401, description = "Missing or invalid credentials."),
        (status = 403, description = "Caller is not an admin."),
    ),
    tag = "audit"
)]
pub async fn list_audit_logs(
    state: Extension<Arc<AppState>>,
    _admin: RequireAdmin,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditPage>, AuthError> {
    Ok(Json(state.audit.list(query.limit, query.offset).await?))
}

#[utoipa::path(
    post,
    path = "/v1/admin/audit-logs/delete",
    request_body = AuditDeleteRequest,
    responses(
        (status = 200, description = "Records deleted.", body = AuditDeleteResponse),
        (status = 401, description = "Missing or invalid credentials."),
        (status = 403, description = "Caller is not an admin."),
    ),
    tag = "audit"
)]
#[instrument(skip_all, fields(requested = request.ids.len()))]
pub async fn delete_audit_logs(
    state: Extension<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    Meta(meta): Meta,
    Json(request): Json<AuditDeleteRequest>,
) -> Result<Json<AuditDeleteResponse>, AuthError> {
    let deleted = state.audit.bulk_delete(&request.ids).await?;

    if deleted > 0 {
        let event = AuditEvent::new(AuditAction::AuditLogsDeleted, "audit_log")
            .with_details(json!({ "requested": request.ids.len(), "deleted": deleted }));
        state.audit.record_or_log(&admin.id, event, &meta).await;
    }

    Ok(Json(AuditDeleteResponse { deleted }))
}
