// tests/integration/fixtures.rs

//! Common test fixtures: tokens, credentials and small peers that speak the
//! framing protocols.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use linkcore::core::protocol::HslPacket;
use linkcore::core::protocol::hsl::HEADER_LENGTH;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const TEST_TOKEN: Uuid = Uuid::from_u128(0x6f1c_2a0e_8d4b_4c55_9a51_3a0e_3b7f_1d42);
pub const OTHER_TOKEN: Uuid = Uuid::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888);
pub const TEST_USER: &str = "admin";
pub const TEST_PASSWORD: &str = "secret";
pub const DTU_PASSWORD: &str = "123456";

/// What a length-prefixed echo peer saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Accepted,
    Received(Vec<u8>),
    Replied(Vec<u8>),
}

/// Payload that makes the echo peer drop the connection without answering.
pub const HANGUP: &[u8] = b"hangup";

/// Spawns a peer that answers each 4-byte-length-prefixed frame with the same
/// frame after `delay`, logging everything it does.
pub async fn spawn_length_prefixed_echo(delay: Duration) -> (SocketAddr, Arc<Mutex<Vec<PeerEvent>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            log.lock().push(PeerEvent::Accepted);
            let log = log.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; 4];
                    if stream.read_exact(&mut header).await.is_err() {
                        return;
                    }
                    let length = u32::from_le_bytes(header) as usize;
                    let mut payload = vec![0u8; length];
                    if stream.read_exact(&mut payload).await.is_err() {
                        return;
                    }
                    log.lock().push(PeerEvent::Received(payload.clone()));
                    if payload == HANGUP {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    log.lock().push(PeerEvent::Replied(payload.clone()));
                    if stream.write_all(&header).await.is_err()
                        || stream.write_all(&payload).await.is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    (addr, events)
}

/// Spawns a peer that answers every envelope with one carrying
/// `reply_opcode` and the request's token and content. Returns the address
/// and the number of accepted connections.
pub async fn spawn_envelope_peer(reply_opcode: i32) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; HEADER_LENGTH];
                    if stream.read_exact(&mut header).await.is_err() {
                        return;
                    }
                    let length = i32::from_le_bytes([header[24], header[25], header[26], header[27]]);
                    let mut frame = header.to_vec();
                    frame.resize(HEADER_LENGTH + length.max(0) as usize, 0);
                    if stream.read_exact(&mut frame[HEADER_LENGTH..]).await.is_err() {
                        return;
                    }
                    let request = HslPacket::decode(&frame).unwrap();
                    let reply = HslPacket::new(reply_opcode, request.user_code, request.token, request.content)
                        .encode()
                        .unwrap();
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, accepted)
}
