// tests/integration/connection_test.rs

//! Connection lifecycle: reuse, reconnect and serialization of exchanges.

use crate::integration::fixtures::{
    HANGUP, PeerEvent, TEST_TOKEN, spawn_envelope_peer, spawn_length_prefixed_echo,
};
use crate::integration::test_helpers::running_transport;
use async_trait::async_trait;
use linkcore::connection::{
    Connection, ConnectionOptions, Connector, HslTransport, LengthPrefixedTransport, TcpConnector,
};
use linkcore::core::protocol::hsl::{HEADER_LENGTH, opcodes};
use linkcore::core::{AnyStream, LinkError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Fails every attempt, optionally after a delay, counting the attempts.
struct FailingConnector {
    attempts: AtomicUsize,
    delay: Duration,
}

impl FailingConnector {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self, _endpoint: &str) -> io::Result<(AnyStream, Option<SocketAddr>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

/// Counts successful dials on top of plain TCP.
#[derive(Default)]
struct CountingConnector {
    dials: AtomicUsize,
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, endpoint: &str) -> io::Result<(AnyStream, Option<SocketAddr>)> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        TcpConnector.connect(endpoint).await
    }
}

fn accepted(events: &[PeerEvent]) -> usize {
    events.iter().filter(|e| **e == PeerEvent::Accepted).count()
}

#[tokio::test]
async fn ephemeral_connection_dials_per_operation() {
    let (addr, events) = spawn_length_prefixed_echo(Duration::ZERO).await;
    let connection = Connection::new(addr.to_string(), LengthPrefixedTransport, running_transport());
    assert!(!connection.is_persistent());

    for payload in [b"one".as_slice(), b"two", b"three"] {
        let reply = connection.read_from_core_server(payload).await.unwrap();
        assert_eq!(reply, payload);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted(&events.lock()), 3);
}

#[tokio::test]
async fn persistent_connection_reuses_its_socket() {
    let (addr, events) = spawn_length_prefixed_echo(Duration::ZERO).await;
    let connection = Connection::new(addr.to_string(), LengthPrefixedTransport, running_transport());
    connection.connect_server().await.unwrap();
    assert!(connection.is_persistent());

    for i in 0..5u8 {
        let reply = connection.read_from_core_server(&[i; 16]).await.unwrap();
        assert_eq!(reply, vec![i; 16]);
    }
    assert_eq!(accepted(&events.lock()), 1);

    connection.connect_close().await.unwrap();
    assert!(!connection.is_persistent());
    assert!(!connection.is_in_error());
}

#[tokio::test]
async fn concurrent_exchanges_never_interleave() {
    let (addr, events) = spawn_length_prefixed_echo(Duration::from_millis(30)).await;
    let connection = Arc::new(
        Connection::new(addr.to_string(), LengthPrefixedTransport, running_transport())
            .with_options(ConnectionOptions {
                persistent: true,
                ..ConnectionOptions::default()
            }),
    );
    assert!(connection.is_persistent());

    let mut tasks = Vec::new();
    for i in 0..4u8 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            let payload = vec![i; 1024];
            let reply = connection.read_from_core_server(&payload).await.unwrap();
            assert_eq!(reply, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every request is answered before the next one reaches the peer.
    let events = events.lock().clone();
    let exchanges: Vec<_> = events
        .into_iter()
        .filter(|e| *e != PeerEvent::Accepted)
        .collect();
    assert_eq!(exchanges.len(), 8);
    for pair in exchanges.chunks(2) {
        match pair {
            [PeerEvent::Received(a), PeerEvent::Replied(b)] => assert_eq!(a, b),
            other => panic!("interleaved exchange: {other:?}"),
        }
    }
}

#[tokio::test]
async fn fast_connect_failure_is_retried_exactly_once() {
    let connector = FailingConnector::new(Duration::ZERO);
    let connection = Connection::new("10.255.0.1:502", LengthPrefixedTransport, running_transport())
        .with_connector(connector.clone());

    let err = connection.read_from_core_server(b"ping").await.unwrap_err();
    assert!(matches!(err, LinkError::Connection { .. }), "got {err:?}");
    assert!(err.code() < 0);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn slow_connect_failure_is_not_retried() {
    let connector = FailingConnector::new(Duration::from_millis(600));
    let connection = Connection::new("10.255.0.1:502", LengthPrefixedTransport, running_transport())
        .with_connector(connector.clone());

    assert!(connection.read_from_core_server(b"ping").await.is_err());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_timeout_surfaces_as_connect_timeout() {
    let connector = FailingConnector::new(Duration::from_secs(30));
    let connection = Connection::new("10.255.0.1:502", LengthPrefixedTransport, running_transport())
        .with_connector(connector.clone())
        .with_options(ConnectionOptions {
            connect_timeout: Duration::from_millis(200),
            ..ConnectionOptions::default()
        });

    let err = connection.connect_server().await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectTimeout { .. }), "got {err:?}");
    assert!(connection.is_in_error());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broken_persistent_socket_is_replaced_on_next_call() {
    let (addr, _events) = spawn_length_prefixed_echo(Duration::ZERO).await;
    let connector = Arc::new(CountingConnector::default());
    let connection = Connection::new(addr.to_string(), LengthPrefixedTransport, running_transport())
        .with_connector(connector.clone())
        .with_options(ConnectionOptions {
            receive_timeout: Some(Duration::from_millis(300)),
            ..ConnectionOptions::default()
        });
    connection.connect_server().await.unwrap();
    assert_eq!(connection.read_from_core_server(b"a").await.unwrap(), b"a");

    let err = connection.read_from_core_server(HANGUP).await.unwrap_err();
    assert!(err.is_connection_error(), "got {err:?}");
    assert!(connection.is_in_error());
    assert!(connection.is_persistent());

    assert_eq!(connection.read_from_core_server(b"b").await.unwrap(), b"b");
    assert!(!connection.is_in_error());
    assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn no_response_mode_returns_after_sending() {
    let (addr, events) = spawn_length_prefixed_echo(Duration::ZERO).await;
    let connection = Connection::new(addr.to_string(), LengthPrefixedTransport, running_transport())
        .with_options(ConnectionOptions {
            receive_timeout: None,
            ..ConnectionOptions::default()
        });

    let reply = connection.read_from_core_server(b"fire").await.unwrap();
    assert!(reply.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        events
            .lock()
            .contains(&PeerEvent::Received(b"fire".to_vec()))
    );
}

#[tokio::test]
async fn wrong_reply_opcode_invalidates_persistent_socket() {
    let (addr, accepted) = spawn_envelope_peer(opcodes::USER_BYTES).await;
    let connection = Connection::new(addr.to_string(), HslTransport::new(TEST_TOKEN), running_transport());
    connection.connect_server().await.unwrap();

    let err = connection.read_string(0, "status").await.unwrap_err();
    assert_eq!(
        err,
        LinkError::OpcodeMismatch {
            expected: opcodes::USER_STRING,
            received: opcodes::USER_BYTES,
        }
    );
    assert!(connection.is_in_error());
    assert!(connection.is_persistent());

    // The next call must dial again rather than reuse the rejected socket.
    let reply = connection.read_bytes(0, &[1, 2, 3]).await.unwrap();
    assert_eq!(reply.as_ref(), &[1, 2, 3]);
    assert!(!connection.is_in_error());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn undecodable_reply_marks_connection_in_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = vec![0u8; HEADER_LENGTH + 4];
                while stream.read_exact(&mut request).await.is_ok() {
                    // A header that declares a negative content length.
                    let mut reply = request[..HEADER_LENGTH].to_vec();
                    reply[24..28].copy_from_slice(&(-1i32).to_le_bytes());
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let connection = Connection::new(addr.to_string(), HslTransport::new(TEST_TOKEN), running_transport());
    connection.connect_server().await.unwrap();

    let err = connection
        .self_check_request(opcodes::USER_BYTES, 0, vec![9u8; 4])
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Protocol(_)), "got {err:?}");
    assert!(connection.is_in_error());

    assert!(connection.read_bytes(0, &[7u8; 4]).await.is_err());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}
