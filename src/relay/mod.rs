//! The rendezvous engine: named channels pairing one sender with one receiver
//!
//! An [`Engine`] holds a registry of channels keyed by an opaque name. A peer
//! attaches to a channel as its sender or its receiver; the first attach
//! spawns a relay worker for the channel, and once both peers are present
//! the worker streams the sender's bytes to the receiver with bounded
//! buffering. Each peer is told exactly once how its session ended.
//!
//! The engine knows nothing about ssh or sockets; sources and sinks are
//! plain async byte streams supplied by the front end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

mod pump;
mod worker;

/// Number of chunks the reader pump may run ahead of the writer. Once the
/// queue is full the reader blocks, so a slow receiver throttles the sender.
pub const QUEUE_DEPTH: usize = 4;

/// Smallest per-read chunk size a sender may request, in bytes.
pub const MIN_CHUNK_SIZE: usize = 64;
/// Largest per-read chunk size a sender may request, in bytes.
pub const MAX_CHUNK_SIZE: usize = 65_536;
/// Chunk size used when the sender does not ask for one.
///
/// Range enforcement is the front end's job; the engine takes the value on
/// trust.
pub const DEFAULT_CHUNK_SIZE: usize = 8_192;

/// Marker trait for the sender's byte stream
pub trait ByteSource: AsyncRead + Send + Unpin {}
impl<T: AsyncRead + Send + Unpin> ByteSource for T {}

/// Marker trait for the receiver's byte stream
pub trait ByteSink: AsyncWrite + Send + Unpin {}
impl<T: AsyncWrite + Send + Unpin> ByteSink for T {}

/// A boxed sender stream, as stored in a channel slot
pub type Source = Box<dyn ByteSource>;
/// A boxed receiver stream, as stored in a channel slot
pub type Sink = Box<dyn ByteSink>;

/// How a relay session ended, as reported to one peer.
pub type Outcome = Result<(), RelayError>;

/// The two ends of a channel
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    strum::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// The peer supplying bytes
    Sender,
    /// The peer consuming bytes
    Receiver,
}

/// Why an attach was refused. Attach failures have no side effects.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum AttachError {
    /// The channel already has a peer in the requested role
    #[error("channel has another active {0}")]
    SlotOccupied(Role),
}

/// A relay failure, as seen by one peer.
///
/// The `Display` strings are exactly what the peer reads on its terminal;
/// the worker picks the variant pair for each failure so that each side
/// gets the message written for it.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RelayError {
    /// A peer asked for the relay to be aborted
    #[error("connection interrupted")]
    Interrupted,
    /// The sender's view of a failed read from its own stream
    #[error("could not upload: connection terminated")]
    UploadFailed,
    /// The receiver's view of the sender's stream failing
    #[error("sender interrupted")]
    SenderGone,
    /// The sender's view of the receiver's stream failing
    #[error("error on the receiver end")]
    ReceiverFailed,
    /// The receiver's view of its own stream failing
    #[error("error downloading")]
    DownloadFailed,
}

/// The process-wide channel registry.
///
/// Cheap to clone; all clones share one registry. Attach operations are
/// serialized by a single mutex with O(1) hold time. A registry entry
/// exists exactly as long as its relay worker is alive, so a name becomes
/// reusable the moment the previous relay has delivered its outcomes.
#[derive(Clone, Default)]
pub struct Engine {
    channels: Registry,
}

pub(crate) type Registry = Arc<Mutex<HashMap<String, Arc<Channel>>>>;

impl Engine {
    /// New engine with an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a sender to the named channel, creating the channel if this
    /// is the first attach. `chunk_size` is the per-read buffer size.
    ///
    /// Must be called from within a tokio runtime: the first attach on a
    /// channel spawns its relay worker.
    ///
    /// # Errors
    /// [`AttachError::SlotOccupied`] if the channel already has a sender.
    pub fn attach_sender(
        &self,
        name: &str,
        source: Source,
        chunk_size: usize,
    ) -> Result<Handle, AttachError> {
        let mut registry = self.channels.lock().expect("registry lock poisoned");
        let channel = registry
            .entry(name.to_owned())
            .or_insert_with(|| Channel::new(name))
            .clone();
        let mut state = channel.state.lock().expect("channel lock poisoned");
        if state.sender.is_some() {
            return Err(AttachError::SlotOccupied(Role::Sender));
        }
        let (done, outcome) = mpsc::channel(1);
        state.sender = Some(SenderSlot {
            source: Some(source),
            chunk_size,
            done,
        });
        debug!(channel = name, "sender attached");
        self.wake(&channel, &mut state);
        drop(state);
        Ok(Handle {
            view: ChannelView {
                channel: channel.clone(),
            },
            outcome,
        })
    }

    /// Attaches a receiver to the named channel, creating the channel if
    /// this is the first attach.
    ///
    /// Must be called from within a tokio runtime: the first attach on a
    /// channel spawns its relay worker.
    ///
    /// # Errors
    /// [`AttachError::SlotOccupied`] if the channel already has a receiver.
    pub fn attach_receiver(&self, name: &str, sink: Sink) -> Result<Handle, AttachError> {
        let mut registry = self.channels.lock().expect("registry lock poisoned");
        let channel = registry
            .entry(name.to_owned())
            .or_insert_with(|| Channel::new(name))
            .clone();
        let mut state = channel.state.lock().expect("channel lock poisoned");
        if state.receiver.is_some() {
            return Err(AttachError::SlotOccupied(Role::Receiver));
        }
        let (done, outcome) = mpsc::channel(1);
        state.receiver = Some(ReceiverSlot {
            sink: Some(sink),
            done,
        });
        debug!(channel = name, "receiver attached");
        self.wake(&channel, &mut state);
        drop(state);
        Ok(Handle {
            view: ChannelView {
                channel: channel.clone(),
            },
            outcome,
        })
    }

    /// Spawns the relay worker on the first attach, then raises `ready`
    /// once both peers are present. Caller holds both locks; everything
    /// here is non-blocking.
    fn wake(&self, channel: &Arc<Channel>, state: &mut ChannelState) {
        if let Some(seed) = state.seed.take() {
            drop(tokio::spawn(worker::run(
                Arc::clone(&self.channels),
                Arc::clone(channel),
                seed,
            )));
        }
        if state.sender.is_some() && state.receiver.is_some() {
            // The seed is handed out before `ready` can fire, so the worker
            // is always there to observe it.
            if let Some(ready) = state.ready.take() {
                let _ = ready.send(());
            }
        }
    }
}

/// Per-name rendezvous state. Slots are mutated under the engine locks;
/// counters and `started` are written by the relay worker's pumps and read
/// by anyone holding a [`ChannelView`].
pub(crate) struct Channel {
    name: String,
    started: AtomicBool,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    interrupt: mpsc::Sender<String>,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    sender: Option<SenderSlot>,
    receiver: Option<ReceiverSlot>,
    ready: Option<oneshot::Sender<()>>,
    seed: Option<WorkerSeed>,
}

struct SenderSlot {
    /// Taken by the worker at launch; cleared again at shutdown so the
    /// front end sees the stream close even if the relay never started.
    source: Option<Source>,
    chunk_size: usize,
    done: mpsc::Sender<Outcome>,
}

struct ReceiverSlot {
    sink: Option<Sink>,
    done: mpsc::Sender<Outcome>,
}

/// The one-shot signals a relay worker consumes. Handing these out exactly
/// once guarantees a single worker per channel.
struct WorkerSeed {
    ready: oneshot::Receiver<()>,
    interrupt: mpsc::Receiver<String>,
}

impl Channel {
    fn new(name: &str) -> Arc<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        // Capacity 1 is all an interrupt needs: the worker only cares that
        // one happened, and extra sends are dropped without blocking.
        let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
        Arc::new(Self {
            name: name.to_owned(),
            started: AtomicBool::new(false),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            interrupt: interrupt_tx,
            state: Mutex::new(ChannelState {
                sender: None,
                receiver: None,
                ready: Some(ready_tx),
                seed: Some(WorkerSeed {
                    ready: ready_rx,
                    interrupt: interrupt_rx,
                }),
            }),
        })
    }

    fn add_up(&self, n: usize) {
        let _ = self.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_down(&self, n: usize) {
        let _ = self.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// A peer's handle on the channel it attached to. Consume [`outcome`](Self::outcome)
/// to learn how the session ended; use a [`view`](Self::view) to watch
/// progress concurrently.
#[derive(Debug)]
pub struct Handle {
    view: ChannelView,
    outcome: mpsc::Receiver<Outcome>,
}

impl Handle {
    /// Waits for this peer's terminal outcome. Delivered exactly once per
    /// successful attach.
    pub async fn outcome(&mut self) -> Outcome {
        // The worker always delivers before dropping the outbox, but a lost
        // outbox reads best as an interruption.
        self.outcome
            .recv()
            .await
            .unwrap_or(Err(RelayError::Interrupted))
    }

    /// A cheap observer of the channel's state, usable while
    /// [`outcome`](Self::outcome) is being awaited.
    #[must_use]
    pub fn view(&self) -> ChannelView {
        self.view.clone()
    }

    /// The channel's name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.view.channel.name
    }

    /// True once streaming has begun
    #[must_use]
    pub fn started(&self) -> bool {
        self.view.started()
    }

    /// Bytes read from the sender so far
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.view.bytes_sent()
    }

    /// Bytes written to the receiver so far
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.view.bytes_received()
    }

    /// Whether a sender is currently attached
    #[must_use]
    pub fn has_sender(&self) -> bool {
        self.view.has_sender()
    }

    /// Whether a receiver is currently attached
    #[must_use]
    pub fn has_receiver(&self) -> bool {
        self.view.has_receiver()
    }

    /// A handle for aborting the relay
    #[must_use]
    pub fn interrupter(&self) -> Interrupter {
        self.view.interrupter()
    }
}

/// Read-only view of a channel's progress, plus the interrupt inbox.
#[derive(Clone)]
pub struct ChannelView {
    channel: Arc<Channel>,
}

impl std::fmt::Debug for ChannelView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelView")
            .field("name", &self.channel.name)
            .finish_non_exhaustive()
    }
}

impl ChannelView {
    /// The channel's name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.channel.name
    }

    /// True once streaming has begun
    #[must_use]
    pub fn started(&self) -> bool {
        self.channel.started.load(Ordering::Relaxed)
    }

    /// Bytes read from the sender so far
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.channel.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes written to the receiver so far
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.channel.bytes_down.load(Ordering::Relaxed)
    }

    /// Whether a sender is currently attached
    #[must_use]
    pub fn has_sender(&self) -> bool {
        self.channel
            .state
            .lock()
            .expect("channel lock poisoned")
            .sender
            .is_some()
    }

    /// Whether a receiver is currently attached
    #[must_use]
    pub fn has_receiver(&self) -> bool {
        self.channel
            .state
            .lock()
            .expect("channel lock poisoned")
            .receiver
            .is_some()
    }

    /// A handle for aborting the relay
    #[must_use]
    pub fn interrupter(&self) -> Interrupter {
        Interrupter(self.channel.interrupt.clone())
    }
}

/// Asks a channel's relay worker to shut down. Clone freely; any number of
/// observers may interrupt.
#[derive(Clone)]
pub struct Interrupter(mpsc::Sender<String>);

impl Interrupter {
    /// Requests the relay be aborted. Never blocks; the first request wins
    /// and repeating it changes nothing. `reason` is recorded in the log.
    pub fn interrupt(&self, reason: impl Into<String>) {
        let _ = self.0.try_send(reason.into());
    }
}
