//! Cached JWKS verifier for provider-issued bearer tokens.
//!
//! Remote keys live in an in-memory cache with a TTL and are revalidated with
//! `If-None-Match`. Refreshes on request paths, whether triggered by a stale
//! cache or an unknown `kid`, share one cooldown window so an unreachable
//! provider costs at most one fetch per window. A failed refresh keeps the
//! last known keys; with no keys at all every token is rejected.

use anyhow::{Context, Result, anyhow};
use reqwest::{
    Client,
    header::{ETAG, IF_NONE_MATCH},
};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::RwLock;
use tracing::{Instrument, info, info_span, instrument, warn};
use url::Url;

use super::TokenError;
use super::jwks::Jwks;
use super::jwt::{VerificationOptions, verify_rs256};
use crate::identity::model::VerifiedExternalIdentity;

/// Google's published keys for Firebase ID tokens.
pub const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

const KEYSET_CACHE_TTL_SECONDS: u64 = 300;
const KEYSET_REFRESH_COOLDOWN_SECONDS: u64 = 30;
const IAT_LEEWAY_SECONDS: i64 = 60;
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Issuer Firebase stamps on ID tokens for `project_id`.
#[must_use]
pub fn firebase_issuer(project_id: &str) -> String {
    format!("https://securetoken.google.com/{project_id}")
}

#[derive(Debug)]
enum KeysetSource {
    /// JWKS loaded from a file or inline value and never refreshed.
    Static,
    /// JWKS fetched from the provider and refreshed as needed.
    Remote { url: String, client: Client },
}

#[derive(Debug, Clone)]
struct KeysetCache {
    jwks: Jwks,
    fetched_at: Instant,
    etag: Option<String>,
}

impl KeysetCache {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < Duration::from_secs(KEYSET_CACHE_TTL_SECONDS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    /// Remote JWKS fetch succeeded.
    Ok,
    /// Remote JWKS is unreachable or invalid.
    Error,
    /// Static keys, nothing to reach.
    Static,
}

impl DependencyStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Static => "static",
        }
    }

    #[must_use]
    pub const fn is_healthy(self) -> bool {
        !matches!(self, Self::Error)
    }
}

#[derive(Debug)]
pub struct TokenVerifier {
    keyset_source: KeysetSource,
    keyset_cache: RwLock<KeysetCache>,
    issuer: String,
    audience: String,
    /// Start of the last request-path refresh attempt, successful or not.
    last_refresh_attempt_unix: AtomicU64,
}

impl TokenVerifier {
    /// Build from a static JWKS, no remote refresh.
    #[must_use]
    pub fn new(jwks: Jwks, issuer: String, audience: String) -> Self {
        Self {
            keyset_source: KeysetSource::Static,
            keyset_cache: RwLock::new(KeysetCache {
                jwks,
                fetched_at: Instant::now(),
                etag: None,
            }),
            issuer,
            audience,
            last_refresh_attempt_unix: AtomicU64::new(0),
        }
    }

    /// Build a verifier that fetches its JWKS from `url`.
    ///
    /// The startup fetch is best-effort: on failure the verifier starts with
    /// an empty, stale cache and rejects tokens until a refresh succeeds.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub async fn new_remote(url: String, issuer: String, audience: String) -> Result<Self> {
        let parsed = Url::parse(&url).context("Invalid JWKS URL")?;
        let loopback = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        if parsed.scheme() != "https" && !loopback {
            return Err(anyhow!("JWKS URL must use https: {url}"));
        }

        let client = Client::builder()
            .use_rustls_tls()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("Failed to build JWKS HTTP client")?;

        let (jwks, fetched_at, last_refresh_attempt_unix, etag) =
            match fetch_jwks(&client, &url, None).await {
                Ok(FetchOutcome::Updated { jwks, etag }) => {
                    (jwks, Instant::now(), now_unix_seconds_u64(), etag)
                }
                Ok(FetchOutcome::NotModified) => {
                    warn!("JWKS fetch returned not-modified during startup");
                    (Jwks::default(), stale_instant(), 0, None)
                }
                Err(err) => {
                    warn!(
                        url = %url,
                        error = %err,
                        "JWKS fetch failed during startup; continuing with empty keyset"
                    );
                    (Jwks::default(), stale_instant(), 0, None)
                }
            };

        Ok(Self {
            keyset_source: KeysetSource::Remote { url, client },
            keyset_cache: RwLock::new(KeysetCache {
                jwks,
                fetched_at,
                etag,
            }),
            issuer,
            audience,
            last_refresh_attempt_unix: AtomicU64::new(last_refresh_attempt_unix),
        })
    }

    pub fn jwks_url(&self) -> Option<&str> {
        match &self.keyset_source {
            KeysetSource::Static => None,
            KeysetSource::Remote { url, .. } => Some(url.as_str()),
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Verify a bearer token against the current wall clock.
    ///
    /// # Errors
    /// Returns the first validation failure; see [`verify_rs256`].
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<VerifiedExternalIdentity, TokenError> {
        self.verify_at(token, now_unix_seconds()).await
    }

    pub(crate) async fn verify_at(
        &self,
        token: &str,
        now_unix_seconds: i64,
    ) -> Result<VerifiedExternalIdentity, TokenError> {
        let options = VerificationOptions {
            expected_issuer: &self.issuer,
            expected_audience: &self.audience,
            now_unix_seconds,
            leeway_seconds: IAT_LEEWAY_SECONDS,
        };

        let jwks = self.keyset_snapshot().await;
        match verify_rs256(token, &jwks, &options) {
            Ok(claims) => claims.into_identity(),
            Err(TokenError::UnknownKid(kid)) => match self.refresh_on_unknown_kid().await {
                Ok(true) => {
                    let jwks = self.keyset_snapshot().await;
                    verify_rs256(token, &jwks, &options)?.into_identity()
                }
                Ok(false) => {
                    warn!(kid = %kid, "token kid not found and refresh suppressed");
                    Err(TokenError::UnknownKid(kid))
                }
                Err(err) => {
                    warn!(kid = %kid, error = %err, "JWKS refresh failed");
                    Err(TokenError::UnknownKid(kid))
                }
            },
            Err(err) => Err(err),
        }
    }

    /// Report key-source health for `/health` by attempting a refresh.
    pub async fn dependency_status(&self) -> DependencyStatus {
        match &self.keyset_source {
            KeysetSource::Static => DependencyStatus::Static,
            KeysetSource::Remote { url, .. } => match self.refresh_keyset().await {
                Ok(()) => DependencyStatus::Ok,
                Err(err) => {
                    warn!(
                        error = %err,
                        url = %url,
                        "JWKS fetch failed during health check"
                    );
                    DependencyStatus::Error
                }
            },
        }
    }

    /// Current keys; refresh if stale, keep the cache if refresh fails.
    async fn keyset_snapshot(&self) -> Jwks {
        let (cached, fresh) = {
            let cache = self.keyset_cache.read().await;
            (cache.jwks.clone(), cache.is_fresh())
        };

        if fresh || matches!(self.keyset_source, KeysetSource::Static) {
            return cached;
        }
        if !self.try_claim_refresh() {
            return cached;
        }

        if let Err(err) = self.refresh_keyset().await {
            warn!(
                error = %err,
                url = ?self.jwks_url(),
                "failed to refresh JWKS cache"
            );
            return cached;
        }

        self.keyset_cache.read().await.jwks.clone()
    }

    async fn refresh_keyset(&self) -> Result<()> {
        let (url, client, etag) = match &self.keyset_source {
            KeysetSource::Static => return Ok(()),
            KeysetSource::Remote { url, client } => {
                let etag = self.keyset_cache.read().await.etag.clone();
                (url.clone(), client.clone(), etag)
            }
        };

        match fetch_jwks(&client, &url, etag.as_deref()).await? {
            FetchOutcome::NotModified => {
                let mut cache = self.keyset_cache.write().await;
                cache.fetched_at = Instant::now();
            }
            FetchOutcome::Updated { jwks, etag } => {
                let mut cache = self.keyset_cache.write().await;
                cache.jwks = jwks;
                cache.fetched_at = Instant::now();
                cache.etag = etag;
                info!(keyset_keys = cache.jwks.keys.len(), "JWKS cache refreshed");
            }
        }
        Ok(())
    }

    /// Refresh when a token names an unknown `kid`, at most once per cooldown.
    async fn refresh_on_unknown_kid(&self) -> Result<bool> {
        if matches!(&self.keyset_source, KeysetSource::Static) {
            return Ok(false);
        }
        if !self.try_claim_refresh() {
            return Ok(false);
        }
        self.refresh_keyset().await?;
        Ok(true)
    }

    /// Take the refresh slot for the current cooldown window. At most one
    /// caller wins per window.
    fn try_claim_refresh(&self) -> bool {
        let now = now_unix_seconds_u64();
        let last = self.last_refresh_attempt_unix.load(Ordering::Acquire);
        if now.saturating_sub(last) < KEYSET_REFRESH_COOLDOWN_SECONDS {
            return false;
        }
        self.last_refresh_attempt_unix
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn now_unix_seconds_u64() -> u64 {
    u64::try_from(now_unix_seconds()).unwrap_or(0)
}

/// An `Instant` that is already past the cache TTL.
fn stale_instant() -> Instant {
    Instant::now()
        .checked_sub(Duration::from_secs(KEYSET_CACHE_TTL_SECONDS + 1))
        .unwrap_or_else(Instant::now)
}

enum FetchOutcome {
    NotModified,
    Updated { jwks: Jwks, etag: Option<String> },
}

async fn fetch_jwks(client: &Client, url: &str, etag: Option<&str>) -> Result<FetchOutcome> {
    let span = info_span!(
        "idp.jwks.fetch",
        http.method = "GET",
        url = %url
    );
    async {
        let mut request = client.get(url);
        if let Some(etag_value) = etag {
            request = request.header(IF_NONE_MATCH, etag_value);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 304 {
            return Ok(FetchOutcome::NotModified);
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(anyhow!("JWKS fetch failed: {status}"));
        }

        let jwks = Jwks::from_json(&body).context("Invalid JWKS JSON")?;
        Ok(FetchOutcome::Updated { jwks, etag })
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::{
        AUDIENCE, ISSUER, NOW, live_claims, sign_token, test_claims, test_jwks,
    };
    use axum::{
        Router,
        http::{HeaderMap, StatusCode, header},
        response::IntoResponse,
        routing::get,
    };
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn static_verifier(kid: &str) -> anyhow::Result<TokenVerifier> {
        Ok(TokenVerifier::new(
            test_jwks(kid)?,
            ISSUER.to_string(),
            AUDIENCE.to_string(),
        ))
    }

    /// Serve the test JWKS with an `ETag`, counting full and conditional hits.
    async fn spawn_jwks_server(
        kid: &'static str,
    ) -> anyhow::Result<(String, Arc<AtomicUsize>, Arc<AtomicUsize>)> {
        let body = serde_json::to_string(&test_jwks(kid)?)?;
        let full = Arc::new(AtomicUsize::new(0));
        let not_modified = Arc::new(AtomicUsize::new(0));
        let (full_hits, conditional_hits) = (full.clone(), not_modified.clone());

        let app = Router::new().route(
            "/jwks.json",
            get(move |headers: HeaderMap| {
                let body = body.clone();
                let full_hits = full_hits.clone();
                let conditional_hits = conditional_hits.clone();
                async move {
                    if headers.get(header::IF_NONE_MATCH).is_some() {
                        conditional_hits.fetch_add(1, Ordering::SeqCst);
                        return StatusCode::NOT_MODIFIED.into_response();
                    }
                    full_hits.fetch_add(1, Ordering::SeqCst);
                    ([(header::ETAG, "\"v1\"")], body).into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((format!("http://127.0.0.1:{}/jwks.json", addr.port()), full, not_modified))
    }

    /// Serve only server errors, counting every hit.
    async fn spawn_failing_jwks_server() -> anyhow::Result<(String, Arc<AtomicUsize>)> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/jwks.json",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((format!("http://127.0.0.1:{}/jwks.json", addr.port()), hits))
    }

    #[tokio::test]
    async fn static_verifier_accepts_valid_token() -> anyhow::Result<()> {
        let verifier = static_verifier("k1")?;
        let token = sign_token("k1", &test_claims("sub-1", "bob@example.com"))?;
        let identity = verifier.verify_at(&token, NOW).await?;
        assert_eq!(identity.subject, "sub-1");
        Ok(())
    }

    #[tokio::test]
    async fn verify_uses_the_wall_clock() -> anyhow::Result<()> {
        let verifier = static_verifier("k1")?;
        let fresh = sign_token("k1", &live_claims("sub-1", "bob@example.com"))?;
        assert!(verifier.verify(&fresh).await.is_ok());

        let stale = sign_token("k1", &test_claims("sub-1", "bob@example.com"))?;
        assert!(matches!(
            verifier.verify(&stale).await,
            Err(TokenError::Expired)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn static_verifier_rejects_unknown_kid_without_refresh() -> anyhow::Result<()> {
        let verifier = static_verifier("k1")?;
        let token = sign_token("k2", &test_claims("sub-1", "bob@example.com"))?;
        assert!(matches!(
            verifier.verify_at(&token, NOW).await,
            Err(TokenError::UnknownKid(_))
        ));
        assert!(!verifier.refresh_on_unknown_kid().await?);
        assert_eq!(verifier.dependency_status().await, DependencyStatus::Static);
        Ok(())
    }

    #[tokio::test]
    async fn empty_keyset_fails_closed() -> anyhow::Result<()> {
        let verifier =
            TokenVerifier::new(Jwks::default(), ISSUER.to_string(), AUDIENCE.to_string());
        let token = sign_token("k1", &test_claims("sub-1", "bob@example.com"))?;
        assert!(verifier.verify_at(&token, NOW).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn refresh_on_unknown_kid_suppresses_within_cooldown() -> anyhow::Result<()> {
        let verifier = TokenVerifier {
            keyset_source: KeysetSource::Remote {
                url: "http://127.0.0.1:9/jwks.json".to_string(),
                client: Client::builder().build()?,
            },
            keyset_cache: RwLock::new(KeysetCache {
                jwks: test_jwks("k1")?,
                fetched_at: Instant::now(),
                etag: None,
            }),
            issuer: ISSUER.to_string(),
            audience: AUDIENCE.to_string(),
            last_refresh_attempt_unix: AtomicU64::new(now_unix_seconds_u64()),
        };
        assert!(!verifier.refresh_on_unknown_kid().await?);
        Ok(())
    }

    #[tokio::test]
    async fn remote_verifier_fetches_and_revalidates_with_etag() -> anyhow::Result<()> {
        let (url, full, not_modified) = spawn_jwks_server("k1").await?;
        let verifier =
            TokenVerifier::new_remote(url, ISSUER.to_string(), AUDIENCE.to_string()).await?;
        assert_eq!(full.load(Ordering::SeqCst), 1);

        let token = sign_token("k1", &test_claims("sub-1", "bob@example.com"))?;
        assert!(verifier.verify_at(&token, NOW).await.is_ok());

        assert_eq!(verifier.dependency_status().await, DependencyStatus::Ok);
        assert_eq!(not_modified.load(Ordering::SeqCst), 1);
        assert_eq!(full.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_remote_starts_empty_and_reports_error() -> anyhow::Result<()> {
        let verifier = TokenVerifier::new_remote(
            "http://127.0.0.1:9/jwks.json".to_string(),
            ISSUER.to_string(),
            AUDIENCE.to_string(),
        )
        .await?;
        let token = sign_token("k1", &test_claims("sub-1", "bob@example.com"))?;
        assert!(verifier.verify_at(&token, NOW).await.is_err());
        assert_eq!(verifier.dependency_status().await, DependencyStatus::Error);
        Ok(())
    }

    #[tokio::test]
    async fn remote_url_must_be_https_unless_loopback() {
        let result = TokenVerifier::new_remote(
            "http://keys.example.test/jwks.json".to_string(),
            ISSUER.to_string(),
            AUDIENCE.to_string(),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn firebase_issuer_embeds_project_id() {
        assert_eq!(
            firebase_issuer("tripgate-prod"),
            "https://securetoken.google.com/tripgate-prod"
        );
    }

    #[tokio::test]
    async fn stale_refresh_is_throttled_while_provider_is_down() -> anyhow::Result<()> {
        let (url, hits) = spawn_failing_jwks_server().await?;
        let verifier = Arc::new(TokenVerifier {
            keyset_source: KeysetSource::Remote {
                url,
                client: Client::builder().timeout(FETCH_TIMEOUT).build()?,
            },
            keyset_cache: RwLock::new(KeysetCache {
                jwks: test_jwks("k1")?,
                fetched_at: stale_instant(),
                etag: None,
            }),
            issuer: ISSUER.to_string(),
            audience: AUDIENCE.to_string(),
            last_refresh_attempt_unix: AtomicU64::new(0),
        });
        let token = sign_token("k1", &test_claims("sub-1", "bob@example.com"))?;

        let mut requests = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let verifier = verifier.clone();
            let token = token.clone();
            requests.spawn(async move { verifier.verify_at(&token, NOW).await });
        }
        while let Some(joined) = requests.join_next().await {
            // Last known keys keep serving while the provider is down.
            assert_eq!(joined??.subject, "sub-1");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        verifier.verify_at(&token, NOW).await?;
        let unknown = sign_token("k2", &test_claims("sub-1", "bob@example.com"))?;
        assert!(verifier.verify_at(&unknown, NOW).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
