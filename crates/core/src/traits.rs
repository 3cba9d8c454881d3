//! Adapter traits for external collaborators
//!
//! The relay endpoint library (key handling, hole punching, QUIC-like stream
//! semantics) is an opaque capability behind the `RelayEndpoint` family, and
//! secret-key persistence is a two-method `SecretStore`. The transport layer
//! is written entirely against these traits; production wires in a real relay
//! implementation, tests wire in `peervault-mock`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ConnectionType, NodeId, Ticket};

/// Creates relay endpoints. The `Endpoint.create` capability.
///
/// `relay_urls` is the custom relay server list; an empty slice means the
/// implementation's defaults.
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    /// One-time process-wide runtime warmup. Called through a shared one-shot
    /// so only the first caller performs work. Implementations with no global
    /// runtime return `Ok(())`.
    async fn initialize_runtime(&self) -> Result<()>;

    async fn create_endpoint(
        &self,
        secret_key: [u8; 32],
        relay_urls: &[String],
    ) -> Result<Arc<dyn RelayEndpoint>>;
}

/// A bound relay endpoint owning the node identity.
#[async_trait]
pub trait RelayEndpoint: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn secret_key_bytes(&self) -> [u8; 32];

    /// Produce a printable coupon another node can dial.
    fn generate_ticket(&self) -> Ticket;

    async fn connect_with_ticket(&self, ticket: &Ticket) -> Result<Arc<dyn RelayConnection>>;

    /// Block until an incoming connection arrives. `Ok(None)` is a spurious
    /// wake; the caller decides whether to keep accepting.
    async fn accept_connection(&self) -> Result<Option<Arc<dyn RelayConnection>>>;

    /// Idempotent teardown; pending accepts observe the closure.
    async fn close(&self);
}

/// One relay-level link to a single remote peer.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    fn remote_node_id(&self) -> NodeId;

    async fn open_stream(&self) -> Result<Box<dyn RelayStream>>;

    async fn accept_stream(&self) -> Result<Box<dyn RelayStream>>;

    fn is_connected(&self) -> bool;

    /// Round-trip time in milliseconds; 0 = unknown.
    fn rtt_ms(&self) -> u32;

    fn connection_type(&self) -> ConnectionType;

    /// Idempotent teardown of the link and all of its streams.
    async fn close(&self);
}

/// A bidirectional ordered byte channel nested inside a relay connection.
///
/// Relay streams are message-granular: `receive` yields one whole message as
/// sent by the peer, so no additional length-prefix framing is applied at
/// this layer.
#[async_trait]
pub trait RelayStream: Send + Sync {
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive one whole message.
    async fn receive(&mut self) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Secret-key persistence adapter.
///
/// The stored blob is expected to be exactly 32 bytes; the transport
/// validates length on load and regenerates on mismatch.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn load_secret_key(&self) -> Result<Option<Vec<u8>>>;

    async fn save_secret_key(&self, key: &[u8]) -> Result<()>;
}
