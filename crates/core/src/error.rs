//! Unified transport error type
//!
//! Every suspending operation in the transport returns `Result<T>`; supervisor
//! loops match on the kind to decide retry vs. terminate, per-operation errors
//! surface to the caller unchanged.

use thiserror::Error;

use crate::types::NodeId;

/// Result type alias used throughout the PeerVault crates.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport error kinds surfaced to callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Operation called before `initialize`.
    #[error("Transport not initialized")]
    NotInitialized,

    /// Underlying relay runtime not initialized; fatal for the instance.
    #[error("Relay runtime not ready: {0}")]
    RuntimeNotReady(String),

    /// Endpoint creation failed with an out-of-memory signature.
    #[error("Relay runtime out of memory: {hint}")]
    RuntimeMemoryExhausted { hint: String },

    /// Dial or accept could not complete.
    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Established connection terminated unexpectedly.
    #[error("Connection to {peer} lost")]
    ConnectionLost { peer: NodeId },

    /// Local or remote close during an in-flight operation.
    #[error("Connection to {peer} closed")]
    ConnectionClosed { peer: NodeId },

    /// Operation on a closed stream.
    #[error("Stream {stream_id} is closed")]
    StreamClosed { stream_id: String },

    /// Send buffer stayed full past the backpressure deadline.
    #[error("Backpressure timeout on stream {stream_id}")]
    BackpressureTimeout { stream_id: String },

    /// Ticket could not be parsed.
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    /// Malformed signaling frame (too short or missing magic).
    #[error("Invalid signaling frame: {0}")]
    InvalidFrame(String),

    /// Well-formed frame with a type byte outside the signaling range.
    #[error("Unknown signaling message type: 0x{0:02x}")]
    UnknownSignalingType(u8),

    /// Peer declined the WebRTC upgrade.
    #[error("Upgrade rejected by {peer}: {reason}")]
    UpgradeRejected { peer: NodeId, reason: String },

    /// Signaling or WebRTC establishment exceeded its deadline.
    #[error("Upgrade timed out")]
    UpgradeTimeout,

    /// Signaling exchange failed mid-handshake.
    #[error("Signaling failed: {0}")]
    SignalingFailed(String),

    /// WebRTC data channel operation failed.
    #[error("Data channel error: {0}")]
    DataChannelError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_strings() {
        let peer = NodeId::from_bytes([1; 32]);
        let err = TransportError::ConnectionLost { peer };
        assert!(err.to_string().contains("lost"));

        let err = TransportError::UnknownSignalingType(0x99);
        assert_eq!(err.to_string(), "Unknown signaling message type: 0x99");

        let err = TransportError::StreamClosed {
            stream_id: "peer-out-1".into(),
        };
        assert!(err.to_string().contains("peer-out-1"));
    }
}
