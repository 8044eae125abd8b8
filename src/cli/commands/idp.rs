//! External identity provider flags, used only with `--trust-mode external`.

use anyhow::{Result, anyhow};
use clap::{Arg, Command};

use crate::identity::token::{FIREBASE_JWKS_URL, firebase_issuer};

pub const ARG_IDP_PROJECT_ID: &str = "idp-project-id";
pub const ARG_IDP_ISSUER: &str = "idp-issuer";
pub const ARG_IDP_AUDIENCE: &str = "idp-audience";
pub const ARG_IDP_JWKS_URL: &str = "idp-jwks-url";
pub const ARG_IDP_JWKS_PATH: &str = "idp-jwks-path";

/// Where the verifier gets its signing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwksSource {
    Url(String),
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub issuer: String,
    pub audience: String,
    pub jwks: JwksSource,
}

impl Options {
    /// Resolve issuer, audience and key source.
    ///
    /// A project id fills in Firebase defaults for whatever is not given
    /// explicitly.
    ///
    /// # Errors
    /// Returns an error when neither a project id nor an explicit
    /// issuer and audience are configured.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let project_id = matches.get_one::<String>(ARG_IDP_PROJECT_ID);

        let issuer = matches
            .get_one::<String>(ARG_IDP_ISSUER)
            .cloned()
            .or_else(|| project_id.map(|id| firebase_issuer(id)))
            .ok_or_else(|| {
                anyhow!("missing required argument: --{ARG_IDP_ISSUER} or --{ARG_IDP_PROJECT_ID}")
            })?;

        let audience = matches
            .get_one::<String>(ARG_IDP_AUDIENCE)
            .or(project_id)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "missing required argument: --{ARG_IDP_AUDIENCE} or --{ARG_IDP_PROJECT_ID}"
                )
            })?;

        let jwks = if let Some(path) = matches.get_one::<String>(ARG_IDP_JWKS_PATH) {
            JwksSource::Path(path.clone())
        } else if let Some(url) = matches.get_one::<String>(ARG_IDP_JWKS_URL) {
            JwksSource::Url(url.clone())
        } else if project_id.is_some() {
            JwksSource::Url(FIREBASE_JWKS_URL.to_string())
        } else {
            return Err(anyhow!(
                "missing required argument: --{ARG_IDP_JWKS_URL} or --{ARG_IDP_JWKS_PATH}"
            ));
        };

        Ok(Self {
            issuer,
            audience,
            jwks,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_IDP_PROJECT_ID)
                .long(ARG_IDP_PROJECT_ID)
                .help("Firebase project id; implies issuer, audience and JWKS URL")
                .env("TRIPGATE_IDP_PROJECT_ID"),
        )
        .arg(
            Arg::new(ARG_IDP_ISSUER)
                .long(ARG_IDP_ISSUER)
                .help("Expected `iss` claim of identity tokens")
                .env("TRIPGATE_IDP_ISSUER"),
        )
        .arg(
            Arg::new(ARG_IDP_AUDIENCE)
                .long(ARG_IDP_AUDIENCE)
                .help("Expected `aud` claim of identity tokens")
                .env("TRIPGATE_IDP_AUDIENCE"),
        )
        .arg(
            Arg::new(ARG_IDP_JWKS_URL)
                .long(ARG_IDP_JWKS_URL)
                .help("JWKS endpoint of the identity provider (https)")
                .env("TRIPGATE_IDP_JWKS_URL")
                .conflicts_with(ARG_IDP_JWKS_PATH),
        )
        .arg(
            Arg::new(ARG_IDP_JWKS_PATH)
                .long(ARG_IDP_JWKS_PATH)
                .help("Path to a static JWKS file (never refreshed)")
                .env("TRIPGATE_IDP_JWKS_PATH"),
        )
}
