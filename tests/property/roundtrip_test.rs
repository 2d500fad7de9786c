// tests/property/roundtrip_test.rs

//! Property-based tests for encode/decode pairs
//! Every envelope, string and length field must come back exactly as it went in.

use crate::test_helpers::{running_transport, socket_pair};
use linkcore::core::transport::LengthPrefixedMessage;
use linkcore::core::protocol::alien::AlienLoginPacket;
use linkcore::core::protocol::hsl::{
    HEADER_LENGTH, HslPacket, SelfCheckProtocol, opcodes, pack_string, pack_string_array, unpack_string, unpack_string_array,
};
use linkcore::core::protocol::mqtt::{MAX_REMAINING_LENGTH, decode_remaining_length, encode_remaining_length};
use proptest::prelude::*;
use std::time::Duration;
use uuid::Uuid;

/// Sends `content` through the acknowledged envelope exchange and returns
/// what the receiving side decoded.
fn checked_exchange(token: Uuid, content: Vec<u8>) -> HslPacket {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let transport = running_transport();
        let protocol = SelfCheckProtocol::new(token).with_receive_timeout(Some(Duration::from_secs(5)));
        let (mut sender, mut receiver) = socket_pair();
        let send_transport = transport.clone();
        let send_protocol = protocol.clone();
        let send = tokio::spawn(async move {
            send_protocol
                .send_and_check(&send_transport, &mut sender, opcodes::USER_BYTES, 9, &content)
                .await
        });
        let packet = protocol.receive_and_check(&transport, &mut receiver).await.unwrap();
        send.await.unwrap().unwrap();
        packet
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_length_prefixed_frame_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let frame = LengthPrefixedMessage::frame(&payload).unwrap();
        prop_assert_eq!(frame.len(), LengthPrefixedMessage::HEADER_LENGTH + payload.len());
        prop_assert_eq!(
            u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize,
            payload.len()
        );
        prop_assert_eq!(LengthPrefixedMessage::payload(&frame).unwrap(), payload.as_slice());
    }

    #[test]
    fn test_hsl_packet_roundtrip(
        opcode in any::<i32>(),
        user_code in any::<i32>(),
        token in any::<u128>(),
        content in prop::collection::vec(any::<u8>(), 0..2048)
    ) {
        let packet = HslPacket::new(opcode, user_code, Uuid::from_u128(token), content.clone());
        let wire = packet.encode().unwrap();
        prop_assert_eq!(wire.len(), HEADER_LENGTH + content.len());
        prop_assert_eq!(HslPacket::decode(&wire).unwrap(), packet);
    }

    #[test]
    fn test_hsl_packet_rejects_truncated_content(
        content in prop::collection::vec(any::<u8>(), 1..256),
        cut in 1usize..256
    ) {
        let wire = HslPacket::new(1001, 0, Uuid::nil(), content.clone()).encode().unwrap();
        let cut = cut.min(content.len());
        prop_assert!(HslPacket::decode(&wire[..wire.len() - cut]).is_err());
    }

    #[test]
    fn test_utf16_string_roundtrip(value in "\\PC{0,200}") {
        let packed = pack_string(&value);
        prop_assert_eq!(packed.len() % 2, 0);
        prop_assert_eq!(unpack_string(&packed).unwrap(), value);
    }

    #[test]
    fn test_string_array_roundtrip(values in prop::collection::vec("\\PC{0,40}", 0..20)) {
        let packed = pack_string_array(&values).unwrap();
        prop_assert_eq!(unpack_string_array(&packed).unwrap(), values);
    }

    #[test]
    fn test_remaining_length_roundtrip(length in 0usize..=MAX_REMAINING_LENGTH) {
        let encoded = encode_remaining_length(length).unwrap();
        prop_assert!((1..=4).contains(&encoded.len()));
        prop_assert_eq!(decode_remaining_length(&encoded).unwrap(), (length, encoded.len()));
    }

    #[test]
    fn test_remaining_length_rejects_oversized(excess in 1usize..1_000_000) {
        prop_assert!(encode_remaining_length(MAX_REMAINING_LENGTH + excess).is_err());
    }

    #[test]
    fn test_alien_login_packet_roundtrip(
        device_id in "[A-Z0-9-]{1,11}",
        password in "[0-9]{6}"
    ) {
        let packet = AlienLoginPacket::new(device_id, password);
        let wire = packet.encode().unwrap();
        prop_assert_eq!(AlienLoginPacket::parse(&wire).unwrap(), packet);
    }

    #[test]
    fn test_acknowledged_exchange_echoes_every_length(
        token in any::<u128>(),
        content in prop_oneof![
            Just(Vec::new()),
            prop::collection::vec(any::<u8>(), 0..4096),
        ]
    ) {
        let token = Uuid::from_u128(token);
        let packet = checked_exchange(token, content.clone());
        prop_assert_eq!(packet.opcode, opcodes::USER_BYTES);
        prop_assert_eq!(packet.user_code, 9);
        prop_assert_eq!(packet.token, token);
        prop_assert_eq!(packet.content.as_ref(), content.as_slice());
    }
}
