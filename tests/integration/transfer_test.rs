// tests/integration/transfer_test.rs

//! File transfer between two sockets, backed by real files.

use crate::integration::test_helpers::{running_transport, socket_pair};
use linkcore::config::ClientConfig;
use linkcore::core::LinkResult;
use linkcore::core::protocol::transfer::chunk_count;
use linkcore::core::protocol::{FileTransfer, FileTransferDescriptor, PayloadCipher, TransferSource};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A toy cipher that flips bits, so the wire never carries the plain bytes.
struct XorCipher(u8);

impl PayloadCipher for XorCipher {
    fn encrypt(&self, plain: &[u8]) -> LinkResult<Vec<u8>> {
        Ok(plain.iter().map(|b| b ^ self.0).collect())
    }

    fn decrypt(&self, cipher: &[u8]) -> LinkResult<Vec<u8>> {
        self.encrypt(cipher)
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn file_is_copied_chunk_by_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.bin");
    let target_path = dir.path().join("target.bin");
    let contents = sample(250_000);
    tokio::fs::write(&source_path, &contents).await.unwrap();

    let transport = running_transport();
    let (mut sender_socket, mut receiver_socket) = socket_pair();

    let acks = Arc::new(Mutex::new(Vec::new()));
    let seen = acks.clone();
    let sender = FileTransfer::new()
        .with_chunk_size(64 * 1024)
        .with_progress(Arc::new(move |done: u64, total: u64| seen.lock().push((done, total))));
    let receiver = FileTransfer::new().with_chunk_size(64 * 1024);

    let send_transport = transport.clone();
    let send = tokio::spawn(async move {
        let descriptor = FileTransferDescriptor {
            name: "firmware/source.bin".to_string(),
            tag: "v2".to_string(),
            uploader: "line-3".to_string(),
            ..FileTransferDescriptor::default()
        };
        sender
            .send(
                &send_transport,
                &mut sender_socket,
                descriptor,
                TransferSource::Path(source_path),
            )
            .await
    });

    let received = receiver
        .receive_to_path(&transport, &mut receiver_socket, &target_path)
        .await
        .unwrap();
    let sent = send.await.unwrap().unwrap();

    assert_eq!(received, sent);
    assert_eq!(received.size, 250_000);
    assert_eq!(received.uploader, "line-3");
    assert_eq!(tokio::fs::read(&target_path).await.unwrap(), contents);

    let acks = acks.lock().clone();
    assert_eq!(acks.len() as u64, chunk_count(250_000, 64 * 1024));
    assert_eq!(acks.last(), Some(&(250_000, 250_000)));
}

#[tokio::test]
async fn cipher_is_applied_per_chunk() {
    let transport = running_transport();
    let (mut sender_socket, mut receiver_socket) = socket_pair();
    let contents = sample(10_000);
    let cipher: Arc<dyn PayloadCipher> = Arc::new(XorCipher(0x5A));

    let sender = FileTransfer::new().with_chunk_size(4096).with_cipher(cipher.clone());
    let receiver = FileTransfer::new().with_chunk_size(4096).with_cipher(cipher);

    let send_transport = transport.clone();
    let payload = contents.clone();
    let send = tokio::spawn(async move {
        sender
            .send(
                &send_transport,
                &mut sender_socket,
                FileTransferDescriptor {
                    name: "blob".to_string(),
                    ..FileTransferDescriptor::default()
                },
                TransferSource::Reader {
                    reader: Box::new(std::io::Cursor::new(payload)),
                    size: 10_000,
                },
            )
            .await
    });

    let mut sink = Vec::new();
    receiver
        .receive(&transport, &mut receiver_socket, &mut sink)
        .await
        .unwrap();
    send.await.unwrap().unwrap();
    assert_eq!(sink, contents);
}

#[tokio::test]
async fn empty_file_sends_only_the_header() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("empty.txt");
    tokio::fs::write(&source_path, b"").await.unwrap();

    let transport = running_transport();
    let (mut sender_socket, mut receiver_socket) = socket_pair();
    let send_transport = transport.clone();
    let send = tokio::spawn(async move {
        FileTransfer::new()
            .send(
                &send_transport,
                &mut sender_socket,
                FileTransferDescriptor {
                    name: "empty.txt".to_string(),
                    ..FileTransferDescriptor::default()
                },
                TransferSource::Path(source_path),
            )
            .await
    });

    let mut sink = Vec::new();
    let descriptor = FileTransfer::new()
        .receive(&transport, &mut receiver_socket, &mut sink)
        .await
        .unwrap();
    send.await.unwrap().unwrap();
    assert_eq!(descriptor.size, 0);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn client_config_sets_chunk_size_and_timeout() {
    let config = ClientConfig {
        file_chunk_size: 4096,
        receive_timeout_ms: 2_000,
        ..ClientConfig::default()
    };
    let acks = Arc::new(Mutex::new(Vec::new()));
    let seen = acks.clone();
    let sender = FileTransfer::from(&config)
        .with_progress(Arc::new(move |done: u64, total: u64| seen.lock().push((done, total))));
    assert_eq!(sender.chunk_size(), 4096);
    assert_eq!(sender.timeout(), Some(Duration::from_millis(2_000)));

    let transport = running_transport();
    let (mut sender_socket, mut receiver_socket) = socket_pair();
    let send_transport = transport.clone();
    let send = tokio::spawn(async move {
        sender
            .send(
                &send_transport,
                &mut sender_socket,
                FileTransferDescriptor {
                    name: "config.bin".to_string(),
                    ..FileTransferDescriptor::default()
                },
                TransferSource::Reader {
                    reader: Box::new(std::io::Cursor::new(sample(10_000))),
                    size: 10_000,
                },
            )
            .await
    });

    let mut sink = Vec::new();
    FileTransfer::from(&config)
        .receive(&transport, &mut receiver_socket, &mut sink)
        .await
        .unwrap();
    send.await.unwrap().unwrap();
    assert_eq!(sink, sample(10_000));
    assert_eq!(acks.lock().len() as u64, chunk_count(10_000, 4096));
}

#[test]
fn negative_receive_timeout_means_no_transfer_deadline() {
    let config = ClientConfig {
        receive_timeout_ms: -1,
        file_chunk_size: 0,
        ..ClientConfig::default()
    };
    let transfer = FileTransfer::from(&config);
    assert_eq!(transfer.timeout(), None);
    assert_eq!(transfer.chunk_size(), 1);
}
