//! The sshd-side bridge: splices one ssh session onto the relay daemon
//!
//! sshd runs `sluice bridge` as the forced command for every relay login.
//! The bridge forwards the peer's requested command line (and, when sshd
//! exposes it, the key that authenticated them) to the daemon in a single
//! [`Hello`], then pumps the session's stdin up the socket and renders the
//! daemon's frames: payload to stdout, chatter to stderr, progress on a
//! spinner.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use human_repr::HumanCount as _;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt as _;
use tokio::net::UnixStream;

use crate::protocol::{Hello, ProtocolMessage as _, ServerFrame};
use crate::relay::Role;

/// Environment variable sshd sets to the command line the peer asked for
const ORIGINAL_COMMAND_ENV_VAR: &str = "SSH_ORIGINAL_COMMAND";
/// File listing the authentication that admitted this session
/// (requires `ExposeAuthInfo yes` in `sshd_config`)
const USER_AUTH_ENV_VAR: &str = "SSH_USER_AUTH";

/// Indicatif template for the progress spinner
const SPINNER_TEMPLATE: &str = "{spinner} {wide_msg}";

/// Arguments accepted by `sluice bridge`
#[derive(Debug, clap::Args)]
pub(crate) struct BridgeArgs {
    /// Path of the daemon socket
    #[arg(long, default_value = "/tmp/sluice.sock")]
    pub(crate) socket: PathBuf,
}

/// Bridge event loop.
///
/// # Return
/// true if the relay reported success for this peer.
pub(crate) async fn bridge_main(args: &BridgeArgs) -> anyhow::Result<bool> {
    let command = peer_command();
    let public_key = public_key_from_env();
    let stream = UnixStream::connect(&args.socket).await.with_context(|| {
        format!(
            "could not reach the relay daemon at {}",
            args.socket.display()
        )
    })?;
    run(stream, command, public_key).await
}

fn peer_command() -> Vec<String> {
    std::env::var(ORIGINAL_COMMAND_ENV_VAR)
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

/// Digs the authenticating public key out of the `SSH_USER_AUTH` file, if
/// sshd was configured to expose it.
fn public_key_from_env() -> Option<String> {
    let path = std::env::var(USER_AUTH_ENV_VAR).ok()?;
    let text = std::fs::read_to_string(path).ok()?;
    parse_user_auth(&text)
}

fn parse_user_auth(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("publickey "))
        .map(|rest| rest.trim().to_owned())
        .next()
}

async fn run(
    stream: UnixStream,
    command: Vec<String>,
    public_key: Option<String>,
) -> anyhow::Result<bool> {
    let (mut rx, mut tx) = stream.into_split();
    Hello {
        command,
        public_key,
    }
    .to_writer_async_framed(&mut tx)
    .await
    .context("could not greet the relay daemon")?;

    // Upload until stdin is exhausted, then half-close so the relay sees
    // EOF. A receiver has nothing to send; its copy simply idles.
    let upload = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let _ = tokio::io::copy(&mut stdin, &mut tx).await;
        let _ = tx.shutdown().await;
    });

    let mut stdout = tokio::io::stdout();
    let mut spinner = ProgressBar::hidden();
    let mut quiet = false;
    let mut role = Role::Sender;
    let success = loop {
        let frame = ServerFrame::from_reader_async_framed(&mut rx)
            .await
            .context("connection to the relay daemon was lost")?;
        match frame {
            ServerFrame::Accepted {
                channel: _,
                role: accepted_role,
                quiet: accepted_quiet,
            } => {
                role = accepted_role;
                quiet = accepted_quiet;
                if !quiet && role == Role::Sender {
                    spinner = ProgressBar::new_spinner().with_style(spinner_style()?);
                    spinner.enable_steady_tick(Duration::from_millis(150));
                    spinner.set_message("Waiting for receiver");
                }
            }
            ServerFrame::Data(bytes) => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
            ServerFrame::Progress { started, bytes } => {
                if !quiet {
                    if started {
                        spinner.set_message(format!("Uploaded {}", bytes.human_count_bytes()));
                    } else {
                        spinner.set_message("Waiting for receiver");
                    }
                }
            }
            ServerFrame::Message(text) => {
                spinner.suspend(|| eprintln!("{text}"));
            }
            ServerFrame::Done { error, bytes } => {
                spinner.finish_and_clear();
                match error {
                    None => {
                        if !quiet {
                            match role {
                                Role::Sender => {
                                    eprintln!("relay complete ({})", bytes.human_count_bytes());
                                }
                                Role::Receiver => eprintln!("relay complete"),
                            }
                        }
                        break true;
                    }
                    Some(text) => {
                        eprintln!("{text}");
                        break false;
                    }
                }
            }
        }
    };
    upload.abort();
    Ok(success)
}

fn spinner_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(SPINNER_TEMPLATE)?)
}
