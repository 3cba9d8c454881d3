//! # PeerVault Mock
//!
//! In-memory relay endpoints implementing the `peervault-core` adapter
//! traits, used as the test oracle for the transport stack.
//!
//! Two registries sit behind one interface:
//!
//! - [`registry::MockNetwork`]: single-process shared map from node id and
//!   ticket to endpoint; the unit-test default. Each `MockNetwork` instance
//!   is an isolated universe.
//! - [`bus::CrossProcessBus`] / [`bus::CrossProcessRegistry`]: a broadcast
//!   bus carrying serialized frames (`connect-request`, `stream-data`, ...),
//!   for two independently running host instances that share nothing but
//!   the channel.
//!
//! Streams come in linked pairs: sends on one side surface as receives on
//! the other, with optional injected latency and a fail-after-N-messages
//! knob for error-path tests. Fault injection (`simulate_disconnect`,
//! `simulate_reconnect`, `partition`) bypasses the transport API entirely.

pub mod bus;
pub mod endpoint;
pub mod registry;
pub mod storage;
pub mod stream;

pub use bus::{CrossProcessBus, CrossProcessRegistry};
pub use endpoint::MockEndpoint;
pub use registry::MockNetwork;
pub use storage::MemorySecretStore;
pub use stream::MockStreamConfig;
