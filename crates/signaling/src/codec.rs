//! Signaling wire codec
//!
//! Frame layout (big-endian):
//!
//! ```text
//! [0..4]   magic "PVWS" (0x50 0x56 0x57 0x53)
//! [4]      type (0x30..=0x36)
//! [5..13]  timestamp, unix millis (u64)
//! [13..]   kind-specific payload:
//!   UpgradeReject:  [4] reason_len  [reason_len] UTF-8
//!   Offer/Answer:   [4] sdp_len     [sdp_len] UTF-8
//!   IceCandidate:   [4] cand_len    [cand_len] UTF-8
//!                   [4] mid_len     [mid_len]  UTF-8 (empty = absent)
//!                   [4] mline_index (i32; -1 = absent)
//!   others:         empty
//! ```
//!
//! Encode and decode are pure, total functions on byte slices; round-trip is
//! bit-exact.

use peervault_core::{Result, TransportError};

use crate::message::{
    SignalingBody, SignalingMessage, MIN_FRAME_LEN, SIGNALING_MAGIC, TYPE_ANSWER,
    TYPE_ICE_CANDIDATE, TYPE_OFFER, TYPE_READY, TYPE_UPGRADE_ACCEPT, TYPE_UPGRADE_REJECT,
    TYPE_UPGRADE_REQUEST,
};

/// Serialize one signaling message.
pub fn encode(msg: &SignalingMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_FRAME_LEN + 64);
    out.extend_from_slice(&SIGNALING_MAGIC);
    out.push(msg.type_byte());
    out.extend_from_slice(&msg.timestamp_ms.to_be_bytes());

    match &msg.body {
        SignalingBody::UpgradeRequest | SignalingBody::UpgradeAccept | SignalingBody::Ready => {}
        SignalingBody::UpgradeReject { reason } => put_string(&mut out, reason),
        SignalingBody::Offer { sdp } | SignalingBody::Answer { sdp } => put_string(&mut out, sdp),
        SignalingBody::IceCandidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => {
            put_string(&mut out, candidate);
            put_string(&mut out, sdp_mid.as_deref().unwrap_or(""));
            out.extend_from_slice(&sdp_mline_index.unwrap_or(-1).to_be_bytes());
        }
    }

    out
}

/// Parse one signaling frame.
pub fn decode(bytes: &[u8]) -> Result<SignalingMessage> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(TransportError::InvalidFrame(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..4] != SIGNALING_MAGIC {
        return Err(TransportError::InvalidFrame("missing PVWS magic".into()));
    }

    let type_byte = bytes[4];
    let timestamp_ms = u64::from_be_bytes(bytes[5..13].try_into().expect("8-byte slice"));
    let mut cursor = Cursor {
        bytes,
        pos: MIN_FRAME_LEN,
    };

    let body = match type_byte {
        TYPE_UPGRADE_REQUEST => SignalingBody::UpgradeRequest,
        TYPE_UPGRADE_ACCEPT => SignalingBody::UpgradeAccept,
        TYPE_UPGRADE_REJECT => SignalingBody::UpgradeReject {
            reason: cursor.take_string()?,
        },
        TYPE_OFFER => SignalingBody::Offer {
            sdp: cursor.take_string()?,
        },
        TYPE_ANSWER => SignalingBody::Answer {
            sdp: cursor.take_string()?,
        },
        TYPE_ICE_CANDIDATE => {
            let candidate = cursor.take_string()?;
            let mid = cursor.take_string()?;
            let mline = cursor.take_i32()?;
            SignalingBody::IceCandidate {
                candidate,
                sdp_mid: (!mid.is_empty()).then_some(mid),
                sdp_mline_index: (mline >= 0).then_some(mline),
            }
        }
        other => return Err(TransportError::UnknownSignalingType(other)),
    };

    Ok(SignalingMessage::new(timestamp_ms, body))
}

/// Whether `bytes` is the start of a signaling frame: full 4-byte magic plus
/// a type byte in the reserved range. Any other first message marks a sync
/// stream. Used by the stream demultiplexer.
pub fn is_signaling_frame(bytes: &[u8]) -> bool {
    bytes.len() >= 5
        && bytes[..4] == SIGNALING_MAGIC
        && (TYPE_UPGRADE_REQUEST..=TYPE_READY).contains(&bytes[4])
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(TransportError::InvalidFrame(format!(
                "truncated payload at offset {}",
                self.pos
            ))),
        }
    }

    fn take_string(&mut self) -> Result<String> {
        let len = u32::from_be_bytes(self.take(4)?.try_into().expect("4-byte slice")) as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| TransportError::InvalidFrame(format!("invalid UTF-8 payload: {e}")))
    }

    fn take_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(
            self.take(4)?.try_into().expect("4-byte slice"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: SignalingBody) -> SignalingMessage {
        let msg = SignalingMessage::new(1_700_000_000_123, body);
        let encoded = encode(&msg);
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded, msg);
        decoded
    }

    #[test]
    fn roundtrip_empty_payload_kinds() {
        roundtrip(SignalingBody::UpgradeRequest);
        roundtrip(SignalingBody::UpgradeAccept);
        roundtrip(SignalingBody::Ready);
    }

    #[test]
    fn roundtrip_reject_preserves_reason() {
        let decoded = roundtrip(SignalingBody::UpgradeReject {
            reason: "Not available".into(),
        });
        assert_eq!(decoded.type_byte(), TYPE_UPGRADE_REJECT);
        match decoded.body {
            SignalingBody::UpgradeReject { reason } => assert_eq!(reason, "Not available"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn roundtrip_offer_answer() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\n".to_string();
        roundtrip(SignalingBody::Offer { sdp: sdp.clone() });
        roundtrip(SignalingBody::Answer { sdp });
    }

    #[test]
    fn roundtrip_ice_candidate_with_and_without_context() {
        roundtrip(SignalingBody::IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
        roundtrip(SignalingBody::IceCandidate {
            candidate: "candidate:2 1 udp 1694498815 203.0.113.9 3478 typ srflx".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        });
    }

    #[test]
    fn encoded_layout_is_fixed() {
        let msg = SignalingMessage::new(7, SignalingBody::UpgradeRequest);
        let encoded = encode(&msg);
        assert_eq!(encoded.len(), MIN_FRAME_LEN);
        assert_eq!(&encoded[..4], b"PVWS");
        assert_eq!(encoded[4], 0x30);
        assert_eq!(encoded[5..13], 7u64.to_be_bytes());
    }

    #[test]
    fn short_frame_is_invalid() {
        let err = decode(&[0x30, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    #[test]
    fn missing_magic_is_invalid() {
        let mut frame = encode(&SignalingMessage::new(0, SignalingBody::Ready));
        frame[0] = 0x00;
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&SIGNALING_MAGIC);
        frame.push(0x99);
        frame.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        let err = decode(&frame).unwrap_err();
        assert_eq!(err, TransportError::UnknownSignalingType(0x99));
    }

    #[test]
    fn truncated_tlv_is_invalid() {
        let mut frame = encode(&SignalingMessage::new(
            0,
            SignalingBody::Offer { sdp: "abcd".into() },
        ));
        frame.truncate(frame.len() - 2);
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    #[test]
    fn classifier_accepts_signaling_rejects_sync() {
        let frame = encode(&SignalingMessage::new(0, SignalingBody::UpgradeRequest));
        assert!(is_signaling_frame(&frame));

        // Sync first byte, even in the reserved type range position.
        assert!(!is_signaling_frame(&[0x01, 0x00, 0x02, 0x03, 0x30]));
        // Magic but type outside the reserved range.
        assert!(!is_signaling_frame(b"PVWS\x29rest"));
        assert!(!is_signaling_frame(b"PVWS\x37rest"));
        // Too short to carry a type byte.
        assert!(!is_signaling_frame(b"PVWS"));
    }
}
