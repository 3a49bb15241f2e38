//! Property tests for the WebSocket frame codec (RFC 6455).
//!
//! Verifies mask involution, round-trips across all payload length
//! encodings, incremental decoding of partial input, and rejection of
//! frames the server must refuse.

mod common;

use bytes::BytesMut;
use common::{init_test_logging, test_proptest_config};
use proptest::prelude::*;
use wschannel::codec::{Decoder, Encoder};
use wschannel::net::websocket::{apply_mask, Frame, FrameCodec, Opcode, WsError};
use wschannel::CloseCode;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_mask_key() -> impl Strategy<Value = [u8; 4]> {
    any::<[u8; 4]>()
}

fn arb_payload_small() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=300)
}

fn arb_payload_any() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=4096)
}

/// Lengths on both sides of each length-form boundary.
fn arb_boundary_len() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(0usize),
        Just(10),
        Just(125),
        Just(126),
        Just(127),
        Just(65535),
        Just(65536),
    ]
}

fn arb_data_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![Just(Opcode::Text), Just(Opcode::Binary)]
}

fn arb_invalid_opcode_byte() -> impl Strategy<Value = u8> {
    prop_oneof![3u8..=7u8, 0x0Bu8..=0x0Fu8]
}

fn data_frame(opcode: Opcode, payload: Vec<u8>) -> Frame {
    match opcode {
        Opcode::Text => Frame::text(payload),
        _ => Frame::binary(payload),
    }
}

fn encode_client(frame: Frame, key: [u8; 4]) -> BytesMut {
    let mut buf = BytesMut::new();
    FrameCodec::client()
        .encode(frame.masked(Some(key)), &mut buf)
        .expect("client encode");
    buf
}

// ============================================================================
// Masking
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(500))]

    /// XOR masking is self-inverse.
    #[test]
    fn mask_is_involution(data in arb_payload_any(), key in arb_mask_key()) {
        init_test_logging();
        let original = data.clone();
        let mut buf = data;
        apply_mask(&mut buf, key);
        apply_mask(&mut buf, key);
        prop_assert_eq!(buf, original, "double masking must yield original data");
    }

    /// Masking with a zero key is identity.
    #[test]
    fn mask_zero_key_is_identity(data in arb_payload_any()) {
        init_test_logging();
        let original = data.clone();
        let mut buf = data;
        apply_mask(&mut buf, [0, 0, 0, 0]);
        prop_assert_eq!(buf, original, "zero mask key should be identity");
    }
}

// ============================================================================
// Round-trips
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(200))]

    /// What a client encodes, the server decodes to the same frame.
    #[test]
    fn client_to_server_round_trip(
        opcode in arb_data_opcode(),
        payload in arb_payload_any(),
        key in arb_mask_key(),
    ) {
        init_test_logging();
        let mut buf = encode_client(data_frame(opcode, payload.clone()), key);

        let decoded = FrameCodec::server()
            .decode(&mut buf)
            .expect("decode")
            .expect("complete frame");
        prop_assert!(decoded.fin);
        prop_assert_eq!(decoded.opcode, opcode);
        prop_assert!(decoded.masked);
        prop_assert_eq!(decoded.mask_key, Some(key));
        prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        prop_assert!(buf.is_empty(), "decode must consume the whole frame");
    }

    /// What the server encodes, a client decodes unmasked.
    #[test]
    fn server_to_client_round_trip(opcode in arb_data_opcode(), payload in arb_payload_any()) {
        init_test_logging();
        let frame = data_frame(opcode, payload.clone());
        let expected_len = frame.encoded_len(false);
        let bytes = FrameCodec::server().encode_to_vec(frame).expect("server encode");
        prop_assert_eq!(bytes.len(), expected_len);

        let mut buf = BytesMut::from(bytes.as_slice());
        let decoded = FrameCodec::client()
            .decode(&mut buf)
            .expect("decode")
            .expect("complete frame");
        prop_assert!(!decoded.masked);
        prop_assert_eq!(decoded.opcode, opcode);
        prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
    }
}

proptest! {
    #![proptest_config(test_proptest_config(32))]

    /// Every length form round-trips at its boundaries.
    #[test]
    fn length_forms_round_trip(len in arb_boundary_len(), key in arb_mask_key()) {
        init_test_logging();
        let payload = vec![b'x'; len];
        let mut buf = encode_client(Frame::text(payload), key);

        let header = buf.len() - len;
        let expected_header = match len {
            0..=125 => 6,
            126..=65535 => 8,
            _ => 14,
        };
        prop_assert_eq!(header, expected_header);

        let decoded = FrameCodec::server()
            .decode(&mut buf)
            .expect("decode")
            .expect("complete frame");
        prop_assert_eq!(decoded.payload.len(), len);
    }
}

// ============================================================================
// Incremental decoding
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(64))]

    /// No strict prefix of a frame decodes, and none is consumed.
    #[test]
    fn strict_prefix_is_incomplete(payload in arb_payload_small(), key in arb_mask_key()) {
        init_test_logging();
        let full = encode_client(Frame::text(payload), key);
        let mut codec = FrameCodec::server();

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            let result = codec.decode(&mut partial).expect("prefix is not an error");
            prop_assert!(result.is_none(), "prefix of {} bytes decoded", cut);
            prop_assert_eq!(partial.len(), cut, "prefix must not be consumed");
        }
    }

    /// Frames split at any point decode once the rest arrives.
    #[test]
    fn split_frame_completes(
        first in arb_payload_small(),
        second in arb_payload_small(),
        key in arb_mask_key(),
        split in any::<prop::sample::Index>(),
    ) {
        init_test_logging();
        let mut wire = encode_client(Frame::text(first.clone()), key);
        wire.extend_from_slice(&encode_client(Frame::binary(second.clone()), key));
        let at = split.index(wire.len());

        let mut codec = FrameCodec::server();
        let mut buf = BytesMut::from(&wire[..at]);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).expect("decode") {
            frames.push(frame);
        }
        buf.extend_from_slice(&wire[at..]);
        while let Some(frame) = codec.decode(&mut buf).expect("decode") {
            frames.push(frame);
        }

        prop_assert_eq!(frames.len(), 2);
        prop_assert_eq!(frames[0].payload.as_ref(), first.as_slice());
        prop_assert_eq!(frames[1].opcode, Opcode::Binary);
        prop_assert_eq!(frames[1].payload.as_ref(), second.as_slice());
    }
}

// ============================================================================
// Rejection
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(200))]

    /// Reserved opcodes are refused as unknown data.
    #[test]
    fn invalid_opcode_rejected(opcode in arb_invalid_opcode_byte(), key in arb_mask_key()) {
        init_test_logging();
        let mut buf = BytesMut::from(&[0x80 | opcode, 0x80, key[0], key[1], key[2], key[3]][..]);
        let err = FrameCodec::server().decode(&mut buf).expect_err("reserved opcode");
        prop_assert!(matches!(err, WsError::InvalidOpcode(_)));
        prop_assert_eq!(err.close_code(), CloseCode::UnknownData);
    }

    /// A server refuses unmasked client frames.
    #[test]
    fn unmasked_client_frame_rejected(payload in arb_payload_small()) {
        init_test_logging();
        let bytes = FrameCodec::server()
            .encode_to_vec(Frame::text(payload))
            .expect("encode");
        let mut buf = BytesMut::from(bytes.as_slice());
        let err = FrameCodec::server().decode(&mut buf).expect_err("unmasked");
        prop_assert!(matches!(err, WsError::UnmaskedClientFrame));
        prop_assert_eq!(err.close_code(), CloseCode::ProtocolError);
    }

    /// Oversized payloads are refused from the header alone.
    #[test]
    fn oversized_payload_rejected(limit in 1usize..=512, extra in 1usize..=64, key in arb_mask_key()) {
        init_test_logging();
        let full = encode_client(Frame::text(vec![b'a'; limit + extra]), key);
        // Header and mask only; the payload never needs to arrive.
        let header_len = full.len() - (limit + extra);
        let mut buf = BytesMut::from(&full[..header_len]);
        let err = FrameCodec::server()
            .max_payload_size(limit)
            .decode(&mut buf)
            .expect_err("too large");
        let is_too_large = matches!(err, WsError::PayloadTooLarge { .. });
        prop_assert!(is_too_large);
        prop_assert_eq!(err.close_code(), CloseCode::LargeFrame);
    }
}
