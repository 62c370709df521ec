//! Chunked reads from a byte stream onto a bounded queue

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt as _;
use tokio::sync::mpsc;

use super::{Channel, Source};

/// One record on the chunk queue: a freshly allocated chunk, or the error
/// that ended the stream. EOF closes the queue with no trailing record.
pub(super) type ReadResult = Result<Bytes, io::Error>;

/// Reads `source` in chunks of at most `chunk_size` bytes and publishes
/// them on `queue`, bumping the channel's sent-byte counter as it goes.
/// Short reads pass through as-is; chunk boundaries are not observable
/// downstream.
///
/// Returns after the first read error, on EOF, or when the queue consumer
/// goes away.
pub(super) async fn read_chunks(
    mut source: Source,
    chunk_size: usize,
    queue: mpsc::Sender<ReadResult>,
    channel: Arc<Channel>,
) {
    loop {
        // A fresh buffer per read; the consumer may hold chunks beyond the
        // next read.
        let mut buffer = BytesMut::zeroed(chunk_size);
        match source.read(&mut buffer).await {
            Ok(0) => return,
            Ok(n) => {
                buffer.truncate(n);
                channel.add_up(n);
                if queue.send(Ok(buffer.freeze())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = queue.send(Err(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::read_chunks;
    use crate::relay::Channel;

    fn channel() -> Arc<Channel> {
        Channel::new("test")
    }

    #[tokio::test]
    async fn chunks_and_eof() {
        let data = vec![7u8; 10];
        let (tx, mut rx) = mpsc::channel(16);
        let ch = channel();
        read_chunks(Box::new(io::Cursor::new(data)), 4, tx, Arc::clone(&ch)).await;

        let mut sizes = Vec::new();
        while let Some(item) = rx.recv().await {
            sizes.push(item.unwrap().len());
        }
        // 10 bytes in chunks of 4: two full chunks and a short one, then
        // the queue closes.
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(ch.bytes_up.load(std::sync::atomic::Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn short_reads_pass_through() {
        let mock = tokio_test::io::Builder::new()
            .read(b"ab")
            .read(b"cdef")
            .build();
        let (tx, mut rx) = mpsc::channel(16);
        let ch = channel();
        read_chunks(Box::new(mock), 1024, tx, Arc::clone(&ch)).await;

        assert_eq!(rx.recv().await.unwrap().unwrap().as_ref(), b"ab");
        assert_eq!(rx.recv().await.unwrap().unwrap().as_ref(), b"cdef");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_error_is_final_record() {
        let mock = tokio_test::io::Builder::new()
            .read(b"xyz")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "gone"))
            .build();
        let (tx, mut rx) = mpsc::channel(16);
        let ch = channel();
        read_chunks(Box::new(mock), 1024, tx, Arc::clone(&ch)).await;

        assert_eq!(rx.recv().await.unwrap().unwrap().as_ref(), b"xyz");
        let err = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(rx.recv().await.is_none());
    }
}
