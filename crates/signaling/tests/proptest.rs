//! Property-based tests for the signaling codec
//!
//! Verifies bit-exact round-trips and total decoding across a wide range of
//! inputs.

use peervault_signaling::{decode, encode, SignalingBody, SignalingMessage};
use proptest::prelude::*;

fn arb_body() -> impl Strategy<Value = SignalingBody> {
    prop_oneof![
        Just(SignalingBody::UpgradeRequest),
        Just(SignalingBody::UpgradeAccept),
        Just(SignalingBody::Ready),
        ".{0,200}".prop_map(|reason| SignalingBody::UpgradeReject { reason }),
        ".{0,500}".prop_map(|sdp| SignalingBody::Offer { sdp }),
        ".{0,500}".prop_map(|sdp| SignalingBody::Answer { sdp }),
        (
            ".{0,200}",
            prop::option::of(".{1,32}"),
            prop::option::of(0i32..1024)
        )
            .prop_map(|(candidate, sdp_mid, sdp_mline_index)| {
                SignalingBody::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                }
            }),
    ]
}

proptest! {
    /// Property: decode(encode(m)) == m for every message.
    #[test]
    fn prop_roundtrip_bit_exact(timestamp_ms in any::<u64>(), body in arb_body()) {
        let msg = SignalingMessage::new(timestamp_ms, body);
        let encoded = encode(&msg);
        let decoded = decode(&encoded).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    /// Property: re-encoding a decoded frame reproduces the original bytes.
    #[test]
    fn prop_encode_is_canonical(timestamp_ms in any::<u64>(), body in arb_body()) {
        let encoded = encode(&SignalingMessage::new(timestamp_ms, body));
        let reencoded = encode(&decode(&encoded).unwrap());
        prop_assert_eq!(reencoded, encoded);
    }

    /// Property: decode never panics on arbitrary bytes.
    #[test]
    fn prop_decode_is_total(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&bytes);
    }

    /// Property: truncating a valid frame below the fixed header is rejected.
    #[test]
    fn prop_truncated_header_rejected(body in arb_body(), keep in 0usize..13) {
        let encoded = encode(&SignalingMessage::new(0, body));
        prop_assert!(decode(&encoded[..keep]).is_err());
    }
}
