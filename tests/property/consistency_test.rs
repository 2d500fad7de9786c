// tests/property/consistency_test.rs

//! Property-based tests for socket reads
//! However the peer splits its writes, the receiver must see the same message.

use crate::test_helpers::running_transport;
use linkcore::core::protocol::hsl::{HslMessage, HslPacket};
use linkcore::core::protocol::resp_frame::pack_command;
use linkcore::core::protocol::MqttMessage;
use linkcore::core::{AnyStream, LinkSocket, ManagedSocket, Transport};
use proptest::prelude::*;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Cuts `wire` at the given (unsorted, possibly repeated) offsets.
fn split_at_points(wire: &[u8], points: &[usize]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = points
        .iter()
        .map(|p| p % (wire.len() + 1))
        .collect();
    cuts.push(0);
    cuts.push(wire.len());
    cuts.sort_unstable();
    cuts.dedup();
    cuts.windows(2).map(|w| wire[w[0]..w[1]].to_vec()).collect()
}

/// Writes each piece separately to the raw end of an in-memory pair and
/// runs `read` against the managed end.
fn deliver_in_pieces<T, F, Fut>(pieces: Vec<Vec<u8>>, read: F) -> T
where
    F: FnOnce(Transport, LinkSocket) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let transport = running_transport();
        let (near, mut raw) = tokio::io::duplex(64 * 1024);
        let receiver = ManagedSocket::new(AnyStream::boxed(near));
        let writer = tokio::spawn(async move {
            for piece in pieces {
                raw.write_all(&piece).await.unwrap();
                raw.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            raw
        });
        let result = read(transport, receiver).await;
        drop(writer.await.unwrap());
        result
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_split_reply_reads_identically(
        args in prop::collection::vec("[a-z0-9]{0,12}", 1..6),
        points in prop::collection::vec(any::<usize>(), 0..8)
    ) {
        let wire = pack_command(&args);
        let expected = wire.clone();
        let received = deliver_in_pieces(split_at_points(&wire, &points), |transport, mut socket| async move {
            transport.receive_reply(&mut socket, TIMEOUT).await.unwrap()
        });
        prop_assert_eq!(received, expected);
    }

    #[test]
    fn test_split_envelope_reads_identically(
        content in prop::collection::vec(any::<u8>(), 0..512),
        points in prop::collection::vec(any::<usize>(), 0..8)
    ) {
        let packet = HslPacket::new(1002, 7, Uuid::from_u128(42), content);
        let wire = packet.encode().unwrap();
        let frame = deliver_in_pieces(split_at_points(&wire, &points), |transport, mut socket| async move {
            transport
                .receive_by_message(&mut socket, TIMEOUT, &HslMessage::new(), None)
                .await
                .unwrap()
        });
        prop_assert_eq!(HslPacket::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn test_split_mqtt_message_reads_identically(
        head in any::<u8>(),
        length in prop_oneof![0usize..200, 16_380usize..16_390],
        points in prop::collection::vec(any::<usize>(), 0..8)
    ) {
        let message = MqttMessage::new(head, vec![0x5A; length]);
        let wire = message.encode().unwrap();
        let received = deliver_in_pieces(split_at_points(&wire, &points), |transport, mut socket| async move {
            transport.receive_mqtt(&mut socket, TIMEOUT).await.unwrap()
        });
        prop_assert_eq!(received, message);
    }
}
