use crate::identity::{Accounts, AuditRecorder, AuthorizationGate, RecordStore, TokenVerifier};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware,
    routing::options,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use url::Url;
use utoipa_axum::router::OpenApiRouter;

pub mod guard;
pub(crate) mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use guard::{Meta, RequireAdmin, RequireUser};
pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// HTTP-facing settings that are not owned by any identity component.
#[derive(Clone, Debug, Default)]
pub struct ApiConfig {
    cookie_secure: bool,
    frontend_base_url: Option<String>,
}

impl ApiConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `Secure` to session cookies. Forced on when the frontend is HTTPS.
    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    /// Origin allowed by CORS, with credentials.
    #[must_use]
    pub fn with_frontend_base_url(mut self, url: Option<String>) -> Self {
        self.frontend_base_url = url;
        self
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
            || self
                .frontend_base_url
                .as_deref()
                .is_some_and(|url| url.starts_with("https://"))
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> Option<&str> {
        self.frontend_base_url.as_deref()
    }
}

/// Everything handlers need, shared behind one `Arc`.
pub struct AppState {
    pub gate: AuthorizationGate,
    pub accounts: Arc<Accounts>,
    pub audit: Arc<AuditRecorder>,
    pub store: Arc<dyn RecordStore>,
    /// Present only under external trust mode; reported by `/health`.
    pub verifier: Option<Arc<TokenVerifier>>,
    pub config: ApiConfig,
}

/// Router with every documented route and the full layer stack.
///
/// # Errors
/// Fails when the configured frontend URL is not a valid origin.
pub fn app(state: Arc<AppState>) -> Result<Router> {
    app_with_routes(state, Router::new())
}

/// Like [`app`], with collaborator routes mounted behind the same layers, so
/// they see the caller's `AuthContext` and can use the guards.
///
/// # Errors
/// Fails when the configured frontend URL is not a valid origin.
pub fn app_with_routes(state: Arc<AppState>, extra: Router) -> Result<Router> {
    let cors = match state.config.frontend_base_url() {
        Some(url) => CorsLayer::new()
            .allow_headers([CONTENT_TYPE, AUTHORIZATION])
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
            ])
            .allow_origin(AllowOrigin::exact(frontend_origin(url)?))
            .allow_credentials(true),
        // No frontend configured: no cross-origin access at all.
        None => CorsLayer::new(),
    };

    // The OpenAPI document stays in openapi.rs for the `openapi` binary.
    let (router, _openapi) = router().split_for_parts();
    let app = router
        .route("/health", options(handlers::health::health))
        .merge(extra)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(state))
                .layer(middleware::from_fn(guard::attach_auth_context)),
        );

    Ok(app)
}

/// Start the server
/// # Errors
/// Return error if failed to bind or serve
pub async fn serve(port: u16, state: Arc<AppState>) -> Result<()> {
    let app = app(state)?;

    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}
