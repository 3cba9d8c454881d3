//! # PeerVault Transport
//!
//! A peer-to-peer transport layer: authenticated bidirectional byte-stream
//! connections across NAT boundaries over a relay, opportunistically
//! upgraded to a direct LAN WebRTC path for lower latency. The API surface
//! (node identity, tickets, connections, multiplexed streams) is uniform
//! regardless of the underlying path.
//!
//! ## Architecture
//!
//! - [`relay_transport::RelayTransport`] owns the relay endpoint, identity
//!   persistence, and the connection accept loop.
//! - [`relay_connection::RelayPeerConnection`] manages one relay link:
//!   streams, accept waiters, subscribers, and a supervised stream loop.
//! - [`webrtc::WebRtcPeerConnection`] is the direct path: DataChannel
//!   streams behind the same peer-connection surface.
//! - [`hybrid::HybridConnection`] composes both and runs the upgrade state
//!   machine over an in-band signaling stream.
//! - [`hybrid_transport::HybridTransport`] is the top-level entry point.
//! - [`demux`] classifies every incoming stream as sync or signaling by its
//!   first framed message, losing no bytes.
//!
//! The relay endpoint itself is an opaque capability behind the adapter
//! traits in `peervault-core`; `peervault-mock` provides in-memory and
//! cross-process implementations for tests.

pub mod backoff;
pub mod config;
pub mod demux;
mod dispatch;
pub mod framing;
pub mod hybrid;
pub mod hybrid_transport;
pub mod logging;
pub mod relay_connection;
pub mod relay_transport;
mod runtime;
pub mod stream;
pub mod subscription;
pub mod webrtc;

pub use config::{TransportConfig, WebRtcConfig};
pub use hybrid::{HybridConnection, UpgradeState};
pub use hybrid_transport::HybridTransport;
pub use relay_connection::RelayPeerConnection;
pub use relay_transport::RelayTransport;
pub use stream::PeerStream;
pub use subscription::Subscription;
