//! Command line interface for sluice

use std::ffi::OsString;
use std::process::ExitCode;

use clap::Parser as _;

use crate::bridge::BridgeArgs;
use crate::config::ServeArgs;

#[derive(Debug, clap::Parser)]
#[command(author, version, about)]
struct CliArgs {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, clap::Subcommand)]
enum Mode {
    /// Run the relay daemon
    Serve(ServeArgs),
    /// Splice an ssh session onto the daemon (sshd forced command)
    Bridge(BridgeArgs),
}

/// Main CLI entrypoint
///
/// Call this from `main`, passing argv.
#[must_use]
pub fn cli<I, T>(args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    match cli_outer(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            if crate::util::tracing_is_initialised() {
                tracing::error!("{e:#}");
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn cli_outer(args: Vec<OsString>) -> anyhow::Result<bool> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(cli_inner(args));
    // A bridge can finish with a blocking stdin read still in flight;
    // waiting for it would wedge shutdown until the peer sent a byte.
    runtime.shutdown_background();
    result
}

/// Inner CLI entrypoint
async fn cli_inner(args: Vec<OsString>) -> anyhow::Result<bool> {
    let args = match CliArgs::try_parse_from(args) {
        Ok(args) => args,
        Err(e) => {
            match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    // this is a normal exit
                    print!("{}", e.render());
                    return Ok(true);
                }
                _ => (),
            }
            // this is an error
            anyhow::bail!(e);
        }
    };

    match args.mode {
        Mode::Serve(serve_args) => crate::server::serve_main(&serve_args).await.map(|()| true),
        Mode::Bridge(bridge_args) => crate::bridge::bridge_main(&bridge_args).await,
    }
}
