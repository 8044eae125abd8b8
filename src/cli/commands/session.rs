//! Local-mode session and cookie flags.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};

pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_SESSION_SWEEP_SECONDS: &str = "session-sweep-seconds";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";

#[derive(Debug)]
pub struct Options {
    pub ttl_seconds: u64,
    pub sweep_seconds: u64,
    pub cookie_secure: bool,
    pub frontend_base_url: Option<String>,
}

impl Options {
    /// # Errors
    /// Returns an error if a defaulted argument is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        Ok(Self {
            ttl_seconds: matches
                .get_one::<u64>(ARG_SESSION_TTL_SECONDS)
                .copied()
                .context("missing required argument: --session-ttl-seconds")?,
            sweep_seconds: matches
                .get_one::<u64>(ARG_SESSION_SWEEP_SECONDS)
                .copied()
                .context("missing required argument: --session-sweep-seconds")?,
            cookie_secure: matches.get_flag(ARG_COOKIE_SECURE),
            frontend_base_url: matches.get_one::<String>(ARG_FRONTEND_BASE_URL).cloned(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session lifetime in seconds")
                .env("TRIPGATE_SESSION_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64).range(60..)),
        )
        .arg(
            Arg::new(ARG_SESSION_SWEEP_SECONDS)
                .long(ARG_SESSION_SWEEP_SECONDS)
                .help("How often expired sessions are purged, in seconds")
                .env("TRIPGATE_SESSION_SWEEP_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark the session cookie Secure (implied by an https frontend URL)")
                .env("TRIPGATE_COOKIE_SECURE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL allowed by CORS (with credentials)")
                .env("TRIPGATE_FRONTEND_BASE_URL"),
        )
}
