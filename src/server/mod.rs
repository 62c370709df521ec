//! Relay daemon event loop

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::config::{Config, ServeArgs};
use crate::relay::Engine;
use crate::util::{self, AuthorizedKeys};

mod naming;
mod session;

/// Daemon entrypoint: binds the socket and serves sessions until killed.
pub(crate) async fn serve_main(args: &ServeArgs) -> anyhow::Result<()> {
    util::setup_tracing(util::trace_level(args.debug, args.quiet))?;
    let config = Arc::new(Config::load(args)?);

    let authorized = match &args.authorized_keys_file {
        Some(path) => {
            let keys = AuthorizedKeys::load(path)?;
            info!(count = keys.len(), "loaded authorized keys");
            Some(Arc::new(keys))
        }
        None => None,
    };

    let listener = bind(&config.bind)?;
    info!(addr = %config.bind.display(), "listening");
    run(Engine::new(), config, authorized, listener).await
}

fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    // A socket file left over from a previous run would make bind fail.
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path).with_context(|| format!("could not listen on {}", path.display()))
}

/// Accept loop: one spawned session task per bridge connection.
async fn run(
    engine: Engine,
    config: Arc<Config>,
    authorized: Option<Arc<AuthorizedKeys>>,
    listener: UnixListener,
) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        debug!("session connected");
        drop(tokio::spawn(session::handle(
            engine.clone(),
            Arc::clone(&config),
            authorized.clone(),
            stream,
        )));
    }
}
