//! Signaling message kinds and wire constants

use std::time::{SystemTime, UNIX_EPOCH};

/// Magic prefix marking a signaling frame: `"PVWS"`.
pub const SIGNALING_MAGIC: [u8; 4] = *b"PVWS";

pub const TYPE_UPGRADE_REQUEST: u8 = 0x30;
pub const TYPE_UPGRADE_ACCEPT: u8 = 0x31;
pub const TYPE_UPGRADE_REJECT: u8 = 0x32;
pub const TYPE_OFFER: u8 = 0x33;
pub const TYPE_ANSWER: u8 = 0x34;
pub const TYPE_ICE_CANDIDATE: u8 = 0x35;
pub const TYPE_READY: u8 = 0x36;

/// Shortest valid frame: magic (4) + type (1) + timestamp (8).
pub const MIN_FRAME_LEN: usize = 13;

/// One signaling message: a type-tagged body plus a unix-millis timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub timestamp_ms: u64,
    pub body: SignalingBody,
}

impl SignalingMessage {
    pub fn new(timestamp_ms: u64, body: SignalingBody) -> Self {
        Self { timestamp_ms, body }
    }

    /// Stamp a body with the current wall-clock time.
    pub fn now(body: SignalingBody) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { timestamp_ms, body }
    }

    pub fn type_byte(&self) -> u8 {
        self.body.type_byte()
    }
}

/// The seven message kinds of the upgrade handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingBody {
    /// Initiator asks the peer to negotiate a direct WebRTC path.
    UpgradeRequest,
    /// Acceptor agrees to negotiate.
    UpgradeAccept,
    /// Acceptor declines; terminal for this connection.
    UpgradeReject { reason: String },
    /// SDP offer from the initiator.
    Offer { sdp: String },
    /// SDP answer from the acceptor.
    Answer { sdp: String },
    /// One trickled ICE candidate.
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<i32>,
    },
    /// Sender's WebRTC peer reached `connected`.
    Ready,
}

impl SignalingBody {
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::UpgradeRequest => TYPE_UPGRADE_REQUEST,
            Self::UpgradeAccept => TYPE_UPGRADE_ACCEPT,
            Self::UpgradeReject { .. } => TYPE_UPGRADE_REJECT,
            Self::Offer { .. } => TYPE_OFFER,
            Self::Answer { .. } => TYPE_ANSWER,
            Self::IceCandidate { .. } => TYPE_ICE_CANDIDATE,
            Self::Ready => TYPE_READY,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::UpgradeRequest => "upgrade-request",
            Self::UpgradeAccept => "upgrade-accept",
            Self::UpgradeReject { .. } => "upgrade-reject",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Ready => "ready",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bytes_cover_reserved_range() {
        let bodies = [
            SignalingBody::UpgradeRequest,
            SignalingBody::UpgradeAccept,
            SignalingBody::UpgradeReject { reason: "".into() },
            SignalingBody::Offer { sdp: "".into() },
            SignalingBody::Answer { sdp: "".into() },
            SignalingBody::IceCandidate {
                candidate: "".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
            SignalingBody::Ready,
        ];
        let types: Vec<u8> = bodies.iter().map(|b| b.type_byte()).collect();
        assert_eq!(types, vec![0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36]);
    }

    #[test]
    fn magic_spells_pvws() {
        assert_eq!(&SIGNALING_MAGIC, b"PVWS");
    }

    #[test]
    fn now_stamps_nonzero_timestamp() {
        let msg = SignalingMessage::now(SignalingBody::Ready);
        assert!(msg.timestamp_ms > 0);
    }
}
