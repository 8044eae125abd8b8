//! Map validated CLI arguments to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{self, idp, session};
use crate::identity::{AdminSeed, StoreKind, TrustMode};
use anyhow::{Context, Result, anyhow};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);

    let store: StoreKind = matches
        .get_one::<String>(commands::ARG_STORE)
        .map_or("postgres", String::as_str)
        .parse()
        .map_err(|err: String| anyhow!(err))?;

    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .map(|dsn| SecretString::from(dsn.clone()));
    if store == StoreKind::Postgres && dsn.is_none() {
        return Err(anyhow!("missing required argument: --dsn"));
    }

    let trust_mode: TrustMode = matches
        .get_one::<String>(commands::ARG_TRUST_MODE)
        .map_or("local", String::as_str)
        .parse()
        .map_err(|err: String| anyhow!(err))?;

    let idp = match trust_mode {
        TrustMode::Local => None,
        TrustMode::External => Some(idp::Options::parse(matches)?),
    };

    let seed_admins = commands::seed_admin_values(matches)
        .iter()
        .map(|raw| AdminSeed::parse(raw, trust_mode).map_err(|err| anyhow!(err)))
        .collect::<Result<Vec<_>>>()
        .context("invalid --seed-admin")?;

    let session = session::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        store,
        dsn,
        trust_mode,
        session_ttl_seconds: session.ttl_seconds,
        session_sweep_seconds: session.sweep_seconds,
        cookie_secure: session.cookie_secure,
        frontend_base_url: session.frontend_base_url,
        idp,
        seed_admins,
    }))
}
