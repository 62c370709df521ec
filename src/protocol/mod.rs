//! Framed messages between the relay daemon and its per-session bridges
//!
//! # On-wire framing
//!
//! All protocol messages are sent in two parts:
//!
//! * [`MessageHeader`]
//! * The encoded message
//!
//! Both the header and payload are encoded using [BARE].
//!
//! Upstream (bridge → daemon) there is exactly one [`Hello`]; everything
//! that follows it on that stream is the sender's raw payload, completely
//! opaque to the protocol. Downstream the daemon sends a sequence of
//! [`ServerFrame`]s ending with [`ServerFrame::Done`].
//!
//! [BARE]: https://www.ietf.org/archive/id/draft-devault-bare-11.html

use anyhow::Error;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::relay::Role;

/// Framing header used on the wire for protocol messages
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Default, Clone, Copy)]
pub struct MessageHeader {
    /// Size of the payload that follows the header
    pub size: u32,
}

impl MessageHeader {
    /// The on-wire size of this struct itself, which is fixed
    pub const SIZE: u32 = 4;
}
impl ProtocolMessage for MessageHeader {}

/// Provides I/O functions for the structs taking part in the session
/// protocol. Callers are expected to use the `..._framed` functions, which
/// include framing.
///
/// N.B. Message structs are not expected to override the provided
/// implementations.
pub trait ProtocolMessage
where
    Self: serde::Serialize + serde::de::DeserializeOwned + Sync,
{
    /// Specifies an absolute limit on the wire encoding of this type.
    /// The `from_..._framed` functions reject any attempt to deserialise a
    /// message with a header frame longer than the given value for the
    /// type. The default comfortably covers a `Data` frame carrying the
    /// largest legal chunk.
    const WIRE_ENCODING_LIMIT: u32 = 131_072;

    /// Checks the passed-in size against this type's
    /// [`WIRE_ENCODING_LIMIT`](Self::WIRE_ENCODING_LIMIT).
    ///
    /// # Errors
    /// Fails if the size exceeds the limit.
    fn check_size(size: usize) -> Result<(), Error> {
        anyhow::ensure!(
            size <= Self::WIRE_ENCODING_LIMIT as usize,
            "wire message size {} was too long for {} (limit: {})",
            size,
            std::any::type_name::<Self>(),
            Self::WIRE_ENCODING_LIMIT
        );
        Ok(())
    }

    /// Creates this struct from a slice of bytes. The slice must be the
    /// correct size for the payload (that's what [`MessageHeader`] is for).
    ///
    /// # Errors
    /// Deserialisation failures surface as-is.
    fn from_slice(slice: &[u8]) -> Result<Self, serde_bare::error::Error> {
        serde_bare::from_slice(slice)
    }

    /// Serializes this struct into a vector of bytes
    ///
    /// # Errors
    /// Serialisation failures surface as-is.
    fn to_vec(&self) -> Result<Vec<u8>, serde_bare::error::Error> {
        serde_bare::to_vec(&self)
    }

    /// Deserializes this struct asynchronously using a given number of
    /// bytes from an async reader.
    fn from_reader_async<R>(
        reader: &mut R,
        size: u32,
    ) -> impl Future<Output = Result<Self, Error>> + Send
    where
        R: AsyncReadExt + std::marker::Unpin + Send,
    {
        async move {
            let mut buffer = BytesMut::zeroed(size as usize);
            let _ = reader.read_exact(&mut buffer).await?;
            Ok(serde_bare::from_slice(&buffer)?)
        }
    }

    /// Deserializes this struct asynchronously from an arbitrary async
    /// reader by reading a [`MessageHeader`], then this struct as payload.
    ///
    /// This function checks the struct's
    /// [`WIRE_ENCODING_LIMIT`](Self::WIRE_ENCODING_LIMIT).
    fn from_reader_async_framed<R>(
        reader: &mut R,
    ) -> impl Future<Output = Result<Self, Error>> + Send
    where
        R: AsyncReadExt + std::marker::Unpin + Send,
    {
        async {
            let header = MessageHeader::from_reader_async(reader, MessageHeader::SIZE).await?;
            Self::check_size(header.size as usize)?;
            Self::from_reader_async(reader, header.size).await
        }
    }

    /// Serializes this struct asynchronously into an arbitrary async writer
    /// by writing a [`MessageHeader`], then this struct as payload
    fn to_writer_async_framed<W>(
        &self,
        writer: &mut W,
    ) -> impl Future<Output = Result<(), Error>> + Send
    where
        W: AsyncWriteExt + std::marker::Unpin + Send,
    {
        async {
            let vec = self.to_vec()?;
            Self::check_size(vec.len())?;
            #[allow(clippy::cast_possible_truncation)] // already checked
            let header = MessageHeader {
                size: vec.len() as u32,
            }
            .to_vec()?;
            writer.write_all(&header).await?;
            Ok(writer.write_all(&vec).await?)
        }
    }
}

/// The first (and only) framed message a bridge sends after connecting.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Hello {
    /// The peer's command line, already split into words
    /// (`SSH_ORIGINAL_COMMAND` on the sshd side)
    pub command: Vec<String>,
    /// The public key that authenticated the peer, in `type base64` form,
    /// when the front end could determine it
    pub public_key: Option<String>,
}
impl ProtocolMessage for Hello {
    // A command line plus one public key; anything bigger is garbage.
    const WIRE_ENCODING_LIMIT: u32 = 8192;
}

/// Frames the daemon sends down to a bridge.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum ServerFrame {
    /// The session was parsed and attached to a channel
    Accepted {
        /// The channel joined
        channel: String,
        /// Which end of it this session is
        role: Role,
        /// Echo of the peer's `--quiet` flag, so the bridge knows whether
        /// to render progress and completion chatter
        quiet: bool,
    },
    /// Payload bytes for the receiver's stdout
    Data(Vec<u8>),
    /// Sender progress tick
    Progress {
        /// Whether streaming has begun (false: still waiting for the
        /// receiver)
        started: bool,
        /// Bytes relayed so far
        bytes: u64,
    },
    /// Free text for the peer's stderr
    Message(String),
    /// Terminal outcome; exactly one per session
    Done {
        /// The peer-facing failure string, or None on success
        error: Option<String>,
        /// Bytes relayed over the session's lifetime
        bytes: u64,
    },
}
impl ProtocolMessage for ServerFrame {}
