//! The per-channel relay worker

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::pump::{self, ReadResult};
use super::{Channel, Outcome, QUEUE_DEPTH, Registry, RelayError, Sink, WorkerSeed};

/// How the pump pair wound down.
enum StreamEnd {
    /// The source reached EOF and every chunk was written
    Eof,
    /// The source failed mid-read
    Source(io::Error),
    /// The sink failed mid-write
    Sink(io::Error),
}

/// Runs one channel's relay from rendezvous to outcome delivery.
///
/// Spawned by the engine on the channel's first attach. Blocks until both
/// peers are present (or an interrupt arrives first), streams until the
/// sender's EOF or the first failure, then delivers one outcome to each
/// attached peer and removes the channel from the registry.
pub(super) async fn run(registry: Registry, channel: Arc<Channel>, seed: WorkerSeed) {
    debug!(channel = %channel.name, "relay worker started");
    let WorkerSeed {
        ready,
        mut interrupt,
    } = seed;

    // Wait phase: nothing to do until both peers are present.
    tokio::select! {
        _ = ready => (),
        reason = interrupt.recv() => {
            debug!(channel = %channel.name, reason = ?reason, "interrupted before rendezvous");
            finish(&registry, &channel, Ok(()), Ok(()));
            return;
        }
    }

    // Launch phase. `ready` has fired, so both slots are populated and the
    // streams are still in them; they are taken exactly once.
    let (source, chunk_size, sink) = {
        let mut state = channel.state.lock().expect("channel lock poisoned");
        let sender = state.sender.as_mut().expect("ready fired without a sender");
        let source = sender.source.take().expect("sender stream already taken");
        let chunk_size = sender.chunk_size;
        let receiver = state
            .receiver
            .as_mut()
            .expect("ready fired without a receiver");
        let sink = receiver.sink.take().expect("receiver stream already taken");
        (source, chunk_size, sink)
    };
    channel.started.store(true, Ordering::Relaxed);
    debug!(channel = %channel.name, chunk_size, "relaying");

    let (chunk_tx, chunk_rx) = mpsc::channel(QUEUE_DEPTH);
    let reader = tokio::spawn(pump::read_chunks(
        source,
        chunk_size,
        chunk_tx,
        Arc::clone(&channel),
    ));
    let mut writer = tokio::spawn(drain(chunk_rx, sink, Arc::clone(&channel)));

    // Supervise phase: whichever of writer completion and interrupt comes
    // first decides the outcome.
    let end = tokio::select! {
        reason = interrupt.recv() => {
            // Stop the writer so nothing further reaches the receiver. The
            // reader exits on its own once its queue or its source closes.
            writer.abort();
            info!(channel = %channel.name, reason = ?reason, "connection interrupted");
            finish(
                &registry,
                &channel,
                Err(RelayError::Interrupted),
                Err(RelayError::Interrupted),
            );
            drop(reader);
            return;
        }
        end = &mut writer => {
            end.unwrap_or_else(|e| StreamEnd::Sink(io::Error::other(e)))
        }
    };
    drop(reader);

    match end {
        StreamEnd::Eof => {
            debug!(
                channel = %channel.name,
                bytes = channel.bytes_up.load(Ordering::Relaxed),
                "relay complete"
            );
            finish(&registry, &channel, Ok(()), Ok(()));
        }
        StreamEnd::Source(e) => {
            info!(channel = %channel.name, err = %e, "error reading from sender");
            finish(
                &registry,
                &channel,
                Err(RelayError::UploadFailed),
                Err(RelayError::SenderGone),
            );
        }
        StreamEnd::Sink(e) => {
            info!(channel = %channel.name, err = %e, "error writing to receiver");
            finish(
                &registry,
                &channel,
                Err(RelayError::ReceiverFailed),
                Err(RelayError::DownloadFailed),
            );
        }
    }
}

/// The writer pump: drains the chunk queue into the sink, counting as it
/// goes. A clean close of the queue means the sender reached EOF.
async fn drain(
    mut queue: mpsc::Receiver<ReadResult>,
    mut sink: Sink,
    channel: Arc<Channel>,
) -> StreamEnd {
    while let Some(item) = queue.recv().await {
        match item {
            Ok(chunk) => {
                if let Err(e) = sink.write_all(&chunk).await {
                    return StreamEnd::Sink(e);
                }
                if let Err(e) = sink.flush().await {
                    return StreamEnd::Sink(e);
                }
                channel.add_down(chunk.len());
            }
            Err(e) => return StreamEnd::Source(e),
        }
    }
    StreamEnd::Eof
}

/// Removes the channel from the registry and delivers the terminal
/// outcomes, in one critical section so that an attach racing our shutdown
/// either lands on a fresh channel or still gets an outcome. Dropping the
/// streams here lets the front end observe EOF even when the relay never
/// started.
fn finish(registry: &Registry, channel: &Channel, sender: Outcome, receiver: Outcome) {
    let mut registry = registry.lock().expect("registry lock poisoned");
    let _ = registry.remove(&channel.name);
    let mut state = channel.state.lock().expect("channel lock poisoned");
    if let Some(slot) = state.sender.as_mut() {
        // A full or abandoned outbox is fine; the slot holds the first
        // outcome and later ones say nothing new.
        let _ = slot.done.try_send(sender);
        slot.source = None;
    }
    if let Some(slot) = state.receiver.as_mut() {
        let _ = slot.done.try_send(receiver);
        slot.sink = None;
    }
    debug!(channel = %channel.name, "relay worker closing");
}
