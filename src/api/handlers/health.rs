use crate::{
    GIT_COMMIT_HASH,
    api::AppState,
    identity::token::DependencyStatus,
};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    trust_mode: String,
    store: String,
    /// `ok`, `error`, `static`, or `disabled` under local trust mode.
    key_source: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Record store and key source are healthy", body = [Health]),
        (status = 503, description = "Record store or key source is unhealthy", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let store = match state.store.ping().await {
        Ok(()) => Ok(()),
        Err(error) => {
            error!("Failed to ping record store: {}", error);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    };

    let key_source = match &state.verifier {
        Some(verifier) => Some(verifier.dependency_status().await),
        None => None,
    };
    let is_healthy = store.is_ok() && key_source.is_none_or(DependencyStatus::is_healthy);

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        trust_mode: state.gate.trust_mode().to_string(),
        store: if store.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
        key_source: key_source.map_or("disabled", DependencyStatus::as_str).to_string(),
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let headers = format!("{}:{}:{}", health.name, health.version, short_hash)
        .parse::<HeaderValue>()
        .map(|x_app_header_value| {
            let mut headers = HeaderMap::new();
            headers.insert("X-App", x_app_header_value);
            headers
        })
        .map_err(|err| {
            error!("Failed to parse X-App header: {}", err);
        })
        .unwrap_or_default();

    debug!(
        store = %health.store,
        key_source = %health.key_source,
        "health checked"
    );

    if is_healthy {
        (StatusCode::OK, headers, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}
