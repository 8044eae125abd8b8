pub mod idp;
pub mod logging;
pub mod session;

use clap::{
    Arg, ArgAction, ArgMatches, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
    parser::ValueSource,
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_STORE: &str = "store";
pub const ARG_TRUST_MODE: &str = "trust-mode";
pub const ARG_SEED_ADMIN: &str = "seed-admin";

/// Raw `--seed-admin` values. Flags are taken whole since passwords may hold
/// any printable character; the env var holds one seed per line.
#[must_use]
pub fn seed_admin_values(matches: &ArgMatches) -> Vec<String> {
    let values = matches
        .get_many::<String>(ARG_SEED_ADMIN)
        .into_iter()
        .flatten();
    if matches.value_source(ARG_SEED_ADMIN) == Some(ValueSource::EnvVariable) {
        values
            .flat_map(|value| value.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        values.cloned().collect()
    }
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("tripgate")
        .about("Identity and authorization authority")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("TRIPGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .long_help("Database connection string. Required unless --store memory.")
                .env("TRIPGATE_DSN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_STORE)
                .long(ARG_STORE)
                .help("Record store backend")
                .env("TRIPGATE_STORE")
                .default_value("postgres")
                .value_parser(["postgres", "memory"]),
        )
        .arg(
            Arg::new(ARG_TRUST_MODE)
                .long(ARG_TRUST_MODE)
                .help("Who vouches for callers: local accounts or an external identity provider")
                .env("TRIPGATE_TRUST_MODE")
                .default_value("local")
                .value_parser(["local", "external"]),
        )
        .arg(
            Arg::new(ARG_SEED_ADMIN)
                .long(ARG_SEED_ADMIN)
                .help("Administrator created on startup if absent (repeatable)")
                .long_help(
                    "Administrator created on startup if absent. Local mode: username:email:password. External mode: subject:email. Repeatable; the env var takes one seed per line.",
                )
                .env("TRIPGATE_SEED_ADMIN")
                .hide_env_values(true)
                .action(ArgAction::Append),
        );

    let command = session::with_args(command);
    let command = idp::with_args(command);
    logging::with_args(command)
}
