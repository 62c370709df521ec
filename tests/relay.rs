//! End-to-end scenarios for the rendezvous engine

use std::io::Cursor;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, duplex};
use tokio::time::sleep;

use sluice::relay::{AttachError, Engine, RelayError, Role, Sink, Source};

fn source_of(data: Vec<u8>) -> Source {
    Box::new(Cursor::new(data))
}

/// A capture sink: the relay writes into the returned sink, and the
/// spawned task collects everything until the relay drops its end.
fn capture() -> (Sink, tokio::task::JoinHandle<Vec<u8>>) {
    let (sink, mut out) = duplex(64 * 1024);
    let collector = tokio::spawn(async move {
        let mut collected = Vec::new();
        let _ = out.read_to_end(&mut collected).await;
        collected
    });
    (Box::new(sink), collector)
}

#[tokio::test]
async fn hello_world() {
    let engine = Engine::new();
    let mut sender = engine
        .attach_sender("hello", source_of(b"hello\n".to_vec()), 8192)
        .unwrap();
    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("hello", sink).unwrap();

    assert_eq!(sender.outcome().await, Ok(()));
    assert_eq!(receiver.outcome().await, Ok(()));
    assert_eq!(collector.await.unwrap(), b"hello\n");
    assert_eq!(sender.bytes_sent(), 6);
    assert_eq!(receiver.bytes_received(), 6);
    assert!(sender.started());
}

#[tokio::test]
async fn zero_byte_input() {
    let engine = Engine::new();
    let mut sender = engine
        .attach_sender("empty", source_of(Vec::new()), 8192)
        .unwrap();
    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("empty", sink).unwrap();

    assert_eq!(sender.outcome().await, Ok(()));
    assert_eq!(receiver.outcome().await, Ok(()));
    assert!(collector.await.unwrap().is_empty());
    assert_eq!(sender.bytes_sent(), 0);
}

#[tokio::test]
async fn sender_waits_for_receiver() {
    let payload = vec![0xabu8; 10 * 1024 * 1024];
    let engine = Engine::new();
    let mut sender = engine
        .attach_sender("big", source_of(payload.clone()), 8192)
        .unwrap();

    // Nothing moves until the receiver shows up.
    sleep(Duration::from_millis(100)).await;
    assert!(!sender.started());
    assert_eq!(sender.bytes_sent(), 0);

    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("big", sink).unwrap();

    assert_eq!(sender.outcome().await, Ok(()));
    assert_eq!(receiver.outcome().await, Ok(()));
    assert_eq!(collector.await.unwrap(), payload);
    assert_eq!(receiver.bytes_received(), 10_485_760);
}

#[tokio::test]
async fn receiver_waits_for_sender() {
    let engine = Engine::new();
    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("patience", sink).unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(!receiver.started());

    let mut sender = engine
        .attach_sender("patience", source_of(b"worth the wait".to_vec()), 8192)
        .unwrap();
    assert_eq!(sender.outcome().await, Ok(()));
    assert_eq!(receiver.outcome().await, Ok(()));
    assert_eq!(collector.await.unwrap(), b"worth the wait");
}

#[tokio::test]
async fn slot_conflict_does_not_disturb_the_transfer() {
    let engine = Engine::new();
    // Feed the sender by hand so the transfer is still live while the
    // conflicting attaches come in.
    let (mut feed, source) = duplex(64 * 1024);
    let mut sender = engine.attach_sender("busy", Box::new(source), 8192).unwrap();
    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("busy", sink).unwrap();

    feed.write_all(&[7u8; 10_000]).await.unwrap();
    assert_eq!(
        engine
            .attach_sender("busy", source_of(Vec::new()), 8192)
            .unwrap_err(),
        AttachError::SlotOccupied(Role::Sender)
    );
    assert_eq!(
        engine
            .attach_receiver("busy", Box::new(Vec::<u8>::new()))
            .unwrap_err(),
        AttachError::SlotOccupied(Role::Receiver)
    );
    feed.write_all(&[7u8; 10_000]).await.unwrap();
    drop(feed);

    assert_eq!(sender.outcome().await, Ok(()));
    assert_eq!(receiver.outcome().await, Ok(()));
    assert_eq!(collector.await.unwrap().len(), 20_000);
}

#[tokio::test]
async fn sender_drop_midstream() {
    let engine = Engine::new();
    let chunk = vec![1u8; 1024];
    let failing_source = tokio_test::io::Builder::new()
        .read(&chunk)
        .read_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "sender died",
        ))
        .build();
    let mut sender = engine
        .attach_sender("fragile", Box::new(failing_source), 8192)
        .unwrap();
    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("fragile", sink).unwrap();

    let sender_outcome = sender.outcome().await.unwrap_err();
    assert_eq!(sender_outcome, RelayError::UploadFailed);
    assert_eq!(
        sender_outcome.to_string(),
        "could not upload: connection terminated"
    );
    let receiver_outcome = receiver.outcome().await.unwrap_err();
    assert_eq!(receiver_outcome, RelayError::SenderGone);
    assert_eq!(receiver_outcome.to_string(), "sender interrupted");

    // Everything read before the failure was delivered.
    assert_eq!(collector.await.unwrap(), chunk);

    // The channel was evicted, so the name is immediately reusable.
    let _fresh = engine
        .attach_sender("fragile", source_of(Vec::new()), 8192)
        .unwrap();
}

#[tokio::test]
async fn receiver_drop_midstream() {
    let engine = Engine::new();
    let chunk_size = 8192usize;
    let good_chunks = 12usize;
    let payload = vec![9u8; chunk_size * 16];

    let mut failing_sink = tokio_test::io::Builder::new();
    for i in 0..good_chunks {
        let _ = failing_sink.write(&payload[i * chunk_size..(i + 1) * chunk_size]);
    }
    let failing_sink = failing_sink
        .write_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "receiver died",
        ))
        .build();

    let mut sender = engine
        .attach_sender("leaky", source_of(payload), chunk_size)
        .unwrap();
    let mut receiver = engine
        .attach_receiver("leaky", Box::new(failing_sink))
        .unwrap();

    let sender_outcome = sender.outcome().await.unwrap_err();
    assert_eq!(sender_outcome, RelayError::ReceiverFailed);
    assert_eq!(sender_outcome.to_string(), "error on the receiver end");
    let receiver_outcome = receiver.outcome().await.unwrap_err();
    assert_eq!(receiver_outcome, RelayError::DownloadFailed);
    assert_eq!(receiver_outcome.to_string(), "error downloading");

    assert_eq!(receiver.bytes_received(), (good_chunks * chunk_size) as u64);
}

#[tokio::test]
async fn interrupt_mid_transfer() {
    let engine = Engine::new();
    // A source that never yields: the relay sits in its read.
    let (_sender_side, source) = duplex(1024);
    let mut sender = engine
        .attach_sender("cancelme", Box::new(source), 8192)
        .unwrap();
    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("cancelme", sink).unwrap();

    // Give the worker a moment to pass rendezvous and start streaming.
    sleep(Duration::from_millis(50)).await;
    assert!(sender.started());

    // N interrupts behave exactly like one.
    let interrupter = receiver.interrupter();
    interrupter.interrupt("context cancelled");
    interrupter.interrupt("context cancelled");
    sender.interrupter().interrupt("me too");

    let sender_outcome = sender.outcome().await.unwrap_err();
    assert_eq!(sender_outcome, RelayError::Interrupted);
    assert_eq!(sender_outcome.to_string(), "connection interrupted");
    assert_eq!(receiver.outcome().await, Err(RelayError::Interrupted));

    // No bytes were written.
    assert!(collector.await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupt_before_rendezvous() {
    let engine = Engine::new();
    let (_sender_side, source) = duplex(1024);
    let mut sender = engine.attach_sender("early", Box::new(source), 8192).unwrap();

    sender.interrupter().interrupt("session closed");
    // A wait-phase interrupt is not an error: nothing had gone wrong yet.
    assert_eq!(sender.outcome().await, Ok(()));
    assert!(!sender.started());

    // The worker evicted the channel on its way out.
    let _fresh = engine
        .attach_sender("early", source_of(Vec::new()), 8192)
        .unwrap();
}

#[tokio::test]
async fn chunk_size_bounds() {
    for chunk_size in [64usize, 65_536] {
        let engine = Engine::new();
        let payload = vec![0x42u8; 300_000];
        let mut sender = engine
            .attach_sender("bounds", source_of(payload.clone()), chunk_size)
            .unwrap();
        let (sink, collector) = capture();
        let mut receiver = engine.attach_receiver("bounds", sink).unwrap();

        assert_eq!(sender.outcome().await, Ok(()));
        assert_eq!(receiver.outcome().await, Ok(()));
        assert_eq!(collector.await.unwrap(), payload);
    }
}

#[tokio::test]
async fn large_transfer_is_bit_exact() {
    let mut payload = vec![0u8; 32 * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);
    let input_digest = Sha256::digest(&payload);

    let engine = Engine::new();
    let mut sender = engine
        .attach_sender("bulk", source_of(payload), 8192)
        .unwrap();
    let (sink, collector) = capture();
    let mut receiver = engine.attach_receiver("bulk", sink).unwrap();

    assert_eq!(sender.outcome().await, Ok(()));
    assert_eq!(receiver.outcome().await, Ok(()));

    let received = collector.await.unwrap();
    assert_eq!(received.len(), 32 * 1024 * 1024);
    assert_eq!(Sha256::digest(&received), input_digest);
    assert_eq!(sender.bytes_sent(), receiver.bytes_received());
}

#[tokio::test]
async fn name_is_reusable_after_success() {
    let engine = Engine::new();
    for round in 0..3u8 {
        let mut sender = engine
            .attach_sender("recycled", source_of(vec![round; 10]), 8192)
            .unwrap();
        let (sink, collector) = capture();
        let mut receiver = engine.attach_receiver("recycled", sink).unwrap();
        assert_eq!(sender.outcome().await, Ok(()));
        assert_eq!(receiver.outcome().await, Ok(()));
        assert_eq!(collector.await.unwrap(), vec![round; 10]);
    }
}
