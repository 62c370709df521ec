//! Daemon configuration

use std::path::PathBuf;

use anyhow::Context as _;

/// Environment variable holding the channel-name salt. Mandatory for
/// `serve`: without a secret, channel names would be guessable from public
/// keys alone.
const SECRET_ENV_VAR: &str = "SLUICE_SECRET";

/// Arguments accepted by `sluice serve`
#[derive(Debug, clap::Args)]
pub(crate) struct ServeArgs {
    /// Path of the unix socket to listen on
    #[arg(long, default_value = "/tmp/sluice.sock")]
    pub(crate) bind: PathBuf,

    /// Public host name for this service, used in connection hints shown
    /// to senders
    #[arg(long, default_value = "sluice.invalid")]
    pub(crate) host: String,

    /// If set, only sessions presenting one of these keys will be accepted
    #[arg(long)]
    pub(crate) authorized_keys_file: Option<PathBuf>,

    /// Log more detail
    #[arg(long)]
    pub(crate) debug: bool,

    /// Log errors only
    #[arg(long, short, conflicts_with = "debug")]
    pub(crate) quiet: bool,
}

/// Assembled daemon configuration
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Socket path to serve on
    pub(crate) bind: PathBuf,
    /// Public host name, for connection hints
    pub(crate) host: String,
    /// Channel-name salt
    pub(crate) secret: String,
}

impl Config {
    /// Combines the command line with the process environment.
    ///
    /// # Errors
    /// Fails if the secret is missing or empty.
    pub(crate) fn load(args: &ServeArgs) -> anyhow::Result<Self> {
        let secret = std::env::var(SECRET_ENV_VAR)
            .with_context(|| format!("{SECRET_ENV_VAR} environment variable missing"))?;
        anyhow::ensure!(!secret.is_empty(), "{SECRET_ENV_VAR} must not be empty");
        Ok(Self {
            bind: args.bind.clone(),
            host: args.host.clone(),
            secret,
        })
    }
}
