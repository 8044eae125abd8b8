//! Local-mode account endpoints: register, login, logout.
//!
//! Under external trust mode the identity provider owns these flows, so all
//! three answer 404.

use axum::{
    Json,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{InvalidHeaderValue, SET_COOKIE},
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, instrument};
use utoipa::ToSchema;

use crate::api::{ApiConfig, AppState};
use crate::identity::{
    AuthError, NewAccount, RequestCredentials, SESSION_COOKIE_NAME, TrustMode, UserRecord,
};

#[derive(Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub user: UserRecord,
    /// Same value as the session cookie, for clients that send a bearer header.
    pub session_token: String,
    pub expires_in: u64,
}

fn require_local_mode(state: &AppState) -> Result<(), AuthError> {
    if state.gate.trust_mode() == TrustMode::Local {
        Ok(())
    } else {
        Err(AuthError::NotFound)
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = NewAccount,
    responses(
        (status = 201, description = "Account created.", body = UserRecord),
        (status = 400, description = "Invalid username, email or password."),
        (status = 404, description = "Local accounts are disabled."),
        (status = 409, description = "Username or email already taken."),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn register(
    state: Extension<Arc<AppState>>,
    Json(account): Json<NewAccount>,
) -> Result<impl IntoResponse, AuthError> {
    require_local_mode(&state)?;
    let user = state.accounts.register(account).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session opened; cookie set.", body = LoginResponse),
        (status = 401, description = "Invalid credentials."),
        (status = 404, description = "Local accounts are disabled."),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    state: Extension<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    require_local_mode(&state)?;
    let (user, token) = state
        .accounts
        .login(&request.username, &request.password)
        .await?;

    let ttl_seconds = state.accounts.sessions().ttl().as_secs();
    let mut headers = HeaderMap::new();
    match session_cookie(&state.config, &token, ttl_seconds) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }

    let response = LoginResponse {
        user,
        session_token: token,
        expires_in: ttl_seconds,
    };
    Ok((StatusCode::OK, headers, Json(response)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session cleared."),
        (status = 404, description = "Local accounts are disabled."),
    ),
    tag = "auth"
)]
pub async fn logout(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    require_local_mode(&state)?;
    let credentials = RequestCredentials::from_headers(&headers);
    for token in [credentials.session_token, credentials.bearer_token]
        .into_iter()
        .flatten()
    {
        if let Err(err) = state.accounts.logout(&token).await {
            error!("Failed to delete session: {err}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(&state.config) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::NO_CONTENT, response_headers))
}

/// `HttpOnly` cookie carrying the session token.
pub(crate) fn session_cookie(
    config: &ApiConfig,
    token: &str,
    ttl_seconds: u64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_session_cookie(config: &ApiConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn session_cookie_is_http_only_with_ttl() -> Result<()> {
        let cookie = session_cookie(&ApiConfig::new(), "abc", 600)?;
        let cookie = cookie.to_str()?;
        assert!(cookie.starts_with("tripgate_session=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=600"));
        assert!(!cookie.contains("Secure"));
        Ok(())
    }

    #[test]
    fn secure_flag_follows_config() -> Result<()> {
        let config = ApiConfig::new().with_cookie_secure(true);
        assert!(session_cookie(&config, "abc", 1)?.to_str()?.ends_with("; Secure"));
        assert!(clear_session_cookie(&config)?.to_str()?.ends_with("; Secure"));
        Ok(())
    }

    #[test]
    fn cleared_cookie_expires_immediately() -> Result<()> {
        let cookie = clear_session_cookie(&ApiConfig::new())?;
        assert!(cookie.to_str()?.contains("tripgate_session=;"));
        assert!(cookie.to_str()?.contains("Max-Age=0"));
        Ok(())
    }

    #[test]
    fn login_request_debug_hides_password() {
        let request = LoginRequest {
            username: "alice".to_string(),
            password: "hunter22".to_string(),
        };
        assert!(!format!("{request:?}").contains("hunter22"));
    }
}
