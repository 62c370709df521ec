//! Sluice is a rendezvous pipe relay reachable over ssh: the network
//! equivalent of a Unix pipe stretched between two machines.
//!
//! One peer connects and offers bytes; another connects and asks for them.
//! As soon as both are attached to the same channel, the relay streams the
//! sender's stdin to the receiver's stdout, byte for byte, until EOF or
//! either side goes away:
//!
//! ```text
//! tar cz photos | ssh relay.example send
//!                 ssh relay.example receive <channel> | tar xz
//! ```
//!
//! ## How it works
//!
//! 1. An ordinary `sshd` authenticates both peers and runs `sluice bridge`
//!    as the forced command for each session.
//! 2. Each bridge forwards the peer's command line over a local socket to
//!    the long-running `sluice serve` daemon, then splices the session's
//!    stdio onto that socket.
//! 3. The daemon's [engine](relay::Engine) pairs the two sessions up by
//!    channel name and relays chunks with a small bounded queue, so a slow
//!    receiver throttles the sender instead of buffering the payload.
//!
//! Channel names are salted digests of the peer's public key (so a sender
//! and receiver owned by the same key find each other with no arguments at
//! all), or single-use random names with `send --random-channel`.
//!
//! Nothing is stored: if the receiver is not there yet, the sender simply
//! waits, and an interrupted transfer is gone.
//!
//! ## Deployment sketch
//!
//! ```text
//! # sshd_config
//! Match User sluice
//!   ForceCommand /usr/bin/sluice bridge
//!   ExposeAuthInfo yes
//!
//! # daemon (e.g. a systemd unit)
//! SLUICE_SECRET=... sluice serve --bind /run/sluice.sock --host relay.example
//! ```
//!
//! The library surface is the [relay] engine itself, which is independent
//! of ssh and sockets; [protocol] describes the daemon⇄bridge framing.

pub(crate) mod bridge;
mod cli;
pub use cli::cli as main;
pub(crate) mod config;
pub mod protocol;
pub mod relay;
pub(crate) mod server;
pub(crate) mod util;
