//! Handler for a single bridge connection

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser as _;
use tokio::io::AsyncReadExt as _;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::config::Config;
use crate::protocol::{Hello, ProtocolMessage as _, ServerFrame};
use crate::relay::{DEFAULT_CHUNK_SIZE, Engine, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, Role};
use crate::util::AuthorizedKeys;

use super::naming;

/// How often a sender's bridge is told about progress. The tick doubles as
/// the liveness probe for the sender side: a failed write means the bridge
/// has gone away.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Buffer between the relay and the receiver session's frame writer.
const RELAY_BUFFER: usize = 2 * MAX_CHUNK_SIZE;

/// The per-session command language, parsed from the argv the bridge
/// forwards (sshd's `SSH_ORIGINAL_COMMAND`).
#[derive(Debug, clap::Parser)]
#[command(
    name = "sluice",
    about = "Pipe bytes from one ssh session to another",
    disable_version_flag = true
)]
struct PeerArgs {
    /// Suppress progress and connection chatter
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: PeerCommand,
}

#[derive(Debug, clap::Subcommand)]
enum PeerCommand {
    /// Stream stdin to whoever receives on the channel
    Send {
        /// Use a single-use random channel instead of the one tied to
        /// your key
        #[arg(long, short)]
        random_channel: bool,

        /// Read size in bytes
        #[arg(
            long,
            short,
            default_value_t = DEFAULT_CHUNK_SIZE as u32,
            value_parser = clap::value_parser!(u32)
                .range(MIN_CHUNK_SIZE as i64..=MAX_CHUNK_SIZE as i64)
        )]
        buffer_size: u32,
    },
    /// Stream a channel to stdout
    Receive {
        /// Channel to receive from; defaults to the channel tied to
        /// your key
        channel: Option<String>,
    },
}

/// Services one bridge connection from `Hello` to `Done`.
pub(super) async fn handle(
    engine: Engine,
    config: Arc<Config>,
    authorized: Option<Arc<AuthorizedKeys>>,
    stream: UnixStream,
) {
    let (mut rx, mut tx) = stream.into_split();
    let hello = match Hello::from_reader_async_framed(&mut rx).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!(err = %e, "bad hello from bridge");
            return;
        }
    };

    if let Some(keys) = &authorized {
        let admitted = hello
            .public_key
            .as_deref()
            .is_some_and(|key| keys.contains(key));
        if !admitted {
            debug!("rejecting unauthorized key");
            let _ = refuse(&mut tx, "access denied").await;
            return;
        }
    }

    let argv = std::iter::once("sluice".to_owned()).chain(hello.command.iter().cloned());
    let args = match PeerArgs::try_parse_from(argv) {
        Ok(args) => args,
        Err(e) => {
            let _ = refuse(&mut tx, &e.render().to_string()).await;
            return;
        }
    };

    let result = match args.command {
        PeerCommand::Send {
            random_channel,
            buffer_size,
        } => {
            serve_sender(
                &engine,
                &config,
                &hello,
                args.quiet,
                random_channel,
                buffer_size as usize,
                rx,
                tx,
            )
            .await
        }
        PeerCommand::Receive { channel } => {
            serve_receiver(&engine, &config, &hello, args.quiet, channel, rx, tx).await
        }
    };
    if let Err(e) = result {
        debug!(err = %e, "session ended abnormally");
    }
}

/// Ends a session that never attached. The error text is all the peer gets.
async fn refuse(tx: &mut OwnedWriteHalf, error: &str) -> Result<()> {
    ServerFrame::Done {
        error: Some(error.to_string()),
        bytes: 0,
    }
    .to_writer_async_framed(tx)
    .await
}

/// The channel a peer lands on when it does not name one: a salted digest
/// of its public key.
fn derived_channel_name(hello: &Hello, config: &Config) -> Result<String> {
    match &hello.public_key {
        Some(key) => Ok(naming::for_key(key, &config.secret)),
        None => anyhow::bail!("no public key presented"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_sender(
    engine: &Engine,
    config: &Config,
    hello: &Hello,
    quiet: bool,
    random_channel: bool,
    buffer_size: usize,
    rx: OwnedReadHalf,
    mut tx: OwnedWriteHalf,
) -> Result<()> {
    let name = if random_channel {
        naming::random(&config.secret)
    } else {
        match derived_channel_name(hello, config) {
            Ok(name) => name,
            Err(e) => return refuse(&mut tx, &format!("could not connect to channel: {e}")).await,
        }
    };
    debug!(channel = name.as_str(), "sender connected");

    // The rest of the upstream socket is the sender's payload.
    let mut handle = match engine.attach_sender(&name, Box::new(rx), buffer_size) {
        Ok(handle) => handle,
        Err(e) => return refuse(&mut tx, &format!("could not connect to channel: {e}")).await,
    };
    let view = handle.view();
    let interrupter = view.interrupter();

    let accepted = ServerFrame::Accepted {
        channel: name.clone(),
        role: Role::Sender,
        quiet,
    };
    if let Err(e) = accepted.to_writer_async_framed(&mut tx).await {
        interrupter.interrupt("sender session closed");
        return Err(e);
    }
    if !quiet {
        let mut chatter = ServerFrame::Message(format!("<- connected to {name} as sender\n"))
            .to_writer_async_framed(&mut tx)
            .await;
        if chatter.is_ok() && !view.has_receiver() {
            let hint = format!(
                "To receive this stream run: ssh {} receive {}\n\
                 You can pipe the output of that command or redirect it to a file to save it.\n",
                config.host, name
            );
            chatter = ServerFrame::Message(hint).to_writer_async_framed(&mut tx).await;
        }
        if let Err(e) = chatter {
            interrupter.interrupt("sender session closed");
            return Err(e);
        }
    }

    // Block until the relay is done or the bridge goes away, ticking
    // progress while we wait.
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        tokio::select! {
            outcome = handle.outcome() => {
                let frame = ServerFrame::Done {
                    error: outcome.err().map(|e| e.to_string()),
                    bytes: view.bytes_sent(),
                };
                let _ = frame.to_writer_async_framed(&mut tx).await;
                break;
            }
            _ = ticker.tick() => {
                let frame = ServerFrame::Progress {
                    started: view.started(),
                    bytes: view.bytes_sent(),
                };
                if frame.to_writer_async_framed(&mut tx).await.is_err() {
                    interrupter.interrupt("sender session closed");
                    break;
                }
            }
        }
    }
    debug!(channel = name.as_str(), "sender disconnected");
    Ok(())
}

async fn serve_receiver(
    engine: &Engine,
    config: &Config,
    hello: &Hello,
    quiet: bool,
    channel: Option<String>,
    mut rx: OwnedReadHalf,
    mut tx: OwnedWriteHalf,
) -> Result<()> {
    let name = match channel
        .map(|c| c.trim().to_owned())
        .filter(|c| !c.is_empty())
    {
        Some(name) => name,
        None => match derived_channel_name(hello, config) {
            Ok(name) => name,
            Err(e) => return refuse(&mut tx, &format!("could not connect to channel: {e}")).await,
        },
    };
    debug!(channel = name.as_str(), "receiver connected");

    // The relay writes into one end of a local pipe; this session frames
    // the other end down to the bridge. The pipe's bounded buffer keeps
    // the relay's backpressure intact, and the relay dropping its end is
    // our signal that the outcome is ready.
    let (sink, mut relayed) = tokio::io::duplex(RELAY_BUFFER);
    let mut handle = match engine.attach_receiver(&name, Box::new(sink)) {
        Ok(handle) => handle,
        Err(e) => return refuse(&mut tx, &format!("could not connect to channel: {e}")).await,
    };
    let view = handle.view();
    let interrupter = view.interrupter();

    let accepted = ServerFrame::Accepted {
        channel: name.clone(),
        role: Role::Receiver,
        quiet,
    };
    if let Err(e) = accepted.to_writer_async_framed(&mut tx).await {
        interrupter.interrupt("receiver session closed");
        return Err(e);
    }
    if !quiet {
        let chatter = ServerFrame::Message(format!("-> connected to {name} as receiver"))
            .to_writer_async_framed(&mut tx)
            .await;
        if let Err(e) = chatter {
            interrupter.interrupt("receiver session closed");
            return Err(e);
        }
    }

    let mut buffer = vec![0u8; MAX_CHUNK_SIZE];
    let mut probe = [0u8; 256];
    let mut peer_alive = true;
    loop {
        tokio::select! {
            read = relayed.read(&mut buffer) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = ServerFrame::Data(buffer[..n].to_vec());
                        if frame.to_writer_async_framed(&mut tx).await.is_err() {
                            interrupter.interrupt("receiver session closed");
                            break;
                        }
                    }
                }
            }
            // Receivers send nothing after their hello, so any read here
            // is either noise (discarded) or the bridge going away.
            read = rx.read(&mut probe), if peer_alive => {
                if matches!(read, Ok(0) | Err(_)) {
                    peer_alive = false;
                    interrupter.interrupt("receiver session closed");
                }
            }
        }
    }

    // Unblock the relay if it is still mid-write, then collect the
    // outcome; it is guaranteed to be delivered once the worker winds up.
    drop(relayed);
    let outcome = handle.outcome().await;
    let _ = ServerFrame::Done {
        error: outcome.err().map(|e| e.to_string()),
        bytes: view.bytes_received(),
    }
    .to_writer_async_framed(&mut tx)
    .await;
    debug!(channel = name.as_str(), "receiver disconnected");
    Ok(())
}
