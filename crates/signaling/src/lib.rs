//! # PeerVault Signaling
//!
//! Deterministic binary codec for the messages that drive the WebRTC
//! SDP offer/answer/ICE handshake over an already-established relay stream.
//!
//! Every frame starts with the 4-byte magic `"PVWS"` followed by a type byte
//! in `0x30..=0x36`. The magic serves double duty: it anchors framing for
//! validation, and it lets the stream demultiplexer classify a stream as
//! signaling from the very first byte of its first message, with no timing
//! heuristics.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, is_signaling_frame};
pub use message::{
    SignalingBody, SignalingMessage, SIGNALING_MAGIC, TYPE_ANSWER, TYPE_ICE_CANDIDATE, TYPE_OFFER,
    TYPE_READY, TYPE_UPGRADE_ACCEPT, TYPE_UPGRADE_REJECT, TYPE_UPGRADE_REQUEST,
};
