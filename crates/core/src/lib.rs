//! # PeerVault Core
//!
//! Common types, adapter traits, and error definitions shared across the
//! PeerVault transport crates.
//!
//! ## Module Structure
//!
//! - `types`: Core type definitions (NodeId, Ticket, connection states)
//! - `traits`: Relay endpoint adapter and secret-key storage adapter
//! - `error`: Unified transport error type

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Result, TransportError};
pub use traits::{EndpointProvider, RelayConnection, RelayEndpoint, RelayStream, SecretStore};
pub use types::{ConnectionState, ConnectionType, NodeId, Ticket};

/// ALPN identifier advertised on every relay connection.
pub const ALPN: &[u8] = b"peervault/sync/1";

/// Length of a node secret key in bytes. The only persisted state.
pub const SECRET_KEY_LEN: usize = 32;
