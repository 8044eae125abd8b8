use crate::{
    api::{self, ApiConfig, AppState},
    cli::commands::idp::{self, JwksSource},
    identity::{
        Accounts, AdminSeed, AuditRecorder, AuthorizationGate, CredentialVault,
        ExternalTokenResolver, IdentityReconciler, IdentityResolver, LocalSessionResolver,
        MemoryStore, PgStore, RecordStore, SessionManager, StoreKind, TokenVerifier, TrustMode,
        session::spawn_session_sweeper, token::Jwks,
    },
};
use anyhow::{Context, Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{fs, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub store: StoreKind,
    pub dsn: Option<SecretString>,
    pub trust_mode: TrustMode,
    pub session_ttl_seconds: u64,
    pub session_sweep_seconds: u64,
    pub cookie_secure: bool,
    pub frontend_base_url: Option<String>,
    /// Set exactly when `trust_mode` is external.
    pub idp: Option<idp::Options>,
    pub seed_admins: Vec<AdminSeed>,
}

/// Wire the store, the identity components and the HTTP server, then serve
/// until shutdown.
/// # Errors
/// Returns an error if the store or key source cannot be initialized, seeding
/// fails, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let store = connect_store(args.store, args.dsn.as_ref()).await?;

    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        Duration::from_secs(args.session_ttl_seconds),
    ));
    let audit = Arc::new(AuditRecorder::new(store.clone()));
    let accounts = Arc::new(
        Accounts::new(
            store.clone(),
            CredentialVault::new(),
            sessions.clone(),
            audit.clone(),
        )
        .context("Failed to initialize accounts")?,
    );

    let (resolver, verifier): (Arc<dyn IdentityResolver>, Option<Arc<TokenVerifier>>) =
        match args.trust_mode {
            TrustMode::Local => {
                spawn_session_sweeper(
                    sessions.clone(),
                    Duration::from_secs(args.session_sweep_seconds),
                );
                (Arc::new(LocalSessionResolver::new(sessions.clone())), None)
            }
            TrustMode::External => {
                let options = args
                    .idp
                    .ok_or_else(|| anyhow!("external trust mode requires identity provider settings"))?;
                let verifier = Arc::new(build_verifier(options).await?);
                let resolver = ExternalTokenResolver::new(
                    verifier.clone(),
                    IdentityReconciler::new(store.clone()),
                );
                (Arc::new(resolver), Some(verifier))
            }
        };

    let created = accounts
        .bootstrap_admins(&args.seed_admins)
        .await
        .context("Failed to seed administrators")?;
    if created > 0 {
        info!(created, "seeded administrators");
    }

    let config = ApiConfig::new()
        .with_cookie_secure(args.cookie_secure)
        .with_frontend_base_url(args.frontend_base_url);

    let state = AppState {
        gate: AuthorizationGate::new(resolver),
        accounts,
        audit,
        store,
        verifier,
        config,
    };

    info!(trust_mode = %args.trust_mode, "identity authority ready");

    api::serve(args.port, Arc::new(state)).await
}

async fn connect_store(
    kind: StoreKind,
    dsn: Option<&SecretString>,
) -> Result<Arc<dyn RecordStore>> {
    match kind {
        StoreKind::Postgres => {
            let dsn = dsn.context("missing required argument: --dsn")?;
            let pool = PgPoolOptions::new()
                .min_connections(1)
                .max_connections(5)
                .max_lifetime(Duration::from_secs(60 * 2))
                .test_before_acquire(true)
                .connect(dsn.expose_secret())
                .await
                .context("Failed to connect to database")?;
            Ok(Arc::new(PgStore::new(pool)))
        }
        StoreKind::Memory => {
            warn!("using the in-memory record store; all data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn build_verifier(options: idp::Options) -> Result<TokenVerifier> {
    match options.jwks {
        JwksSource::Url(url) => {
            TokenVerifier::new_remote(url, options.issuer, options.audience).await
        }
        JwksSource::Path(path) => {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read JWKS file: {path}"))?;
            let jwks = Jwks::from_json(&json).context("Invalid JWKS JSON")?;
            if jwks.is_empty() {
                return Err(anyhow!("JWKS file contains no keys: {path}"));
            }
            Ok(TokenVerifier::new(jwks, options.issuer, options.audience))
        }
    }
}
