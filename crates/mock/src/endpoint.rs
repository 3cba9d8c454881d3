//! Mock relay endpoint and connection
//!
//! Implements the `peervault-core` adapter traits over in-process channels.
//! The node id is the Ed25519 verifying key of the 32-byte secret, so an
//! endpoint recreated from the same persisted secret keeps its identity.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use peervault_core::{
    ConnectionType, NodeId, RelayConnection, RelayEndpoint, RelayStream, Result, Ticket,
    TransportError,
};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::registry::MockRegistry;
use crate::stream::{linked_pair, MockStreamConfig};

/// Derive the public node id from a secret key, the way a real relay
/// endpoint would.
pub fn derive_node_id(secret_key: &[u8; 32]) -> NodeId {
    let signing = SigningKey::from_bytes(secret_key);
    NodeId::from_bytes(signing.verifying_key().to_bytes())
}

/// Render the dialable coupon for a node.
pub fn ticket_for(node: &NodeId) -> Ticket {
    Ticket::new(format!("mock://{node}"))
}

/// A mock endpoint bound into a registry.
pub struct MockEndpoint {
    secret_key: [u8; 32],
    node_id: NodeId,
    registry: Arc<dyn MockRegistry>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<Arc<dyn RelayConnection>>>,
    closed: AtomicBool,
}

impl MockEndpoint {
    /// Bind an endpoint and make it dialable through `registry`.
    pub fn bind(secret_key: [u8; 32], registry: Arc<dyn MockRegistry>) -> Arc<Self> {
        let node_id = derive_node_id(&secret_key);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        registry.register(node_id, accept_tx);
        debug!(node = %node_id.fingerprint(), "mock endpoint bound");
        Arc::new(Self {
            secret_key,
            node_id,
            registry,
            accept_rx: Mutex::new(accept_rx),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl RelayEndpoint for MockEndpoint {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn secret_key_bytes(&self) -> [u8; 32] {
        self.secret_key
    }

    fn generate_ticket(&self) -> Ticket {
        ticket_for(&self.node_id)
    }

    async fn connect_with_ticket(&self, ticket: &Ticket) -> Result<Arc<dyn RelayConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotInitialized);
        }
        self.registry.dial(self.node_id, ticket).await
    }

    async fn accept_connection(&self) -> Result<Option<Arc<dyn RelayConnection>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        // A drained, closed channel is a plain "nothing to accept".
        Ok(self.accept_rx.lock().await.recv().await)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.registry.unregister(&self.node_id);
            self.accept_rx.lock().await.close();
        }
    }
}

/// One half of a linked mock connection pair. Halves are joined only by
/// channels and a shared liveness flag; neither owns the other.
pub struct MockConnection {
    local: NodeId,
    remote: NodeId,
    alive: Arc<AtomicBool>,
    to_peer: StdMutex<Option<mpsc::UnboundedSender<Box<dyn RelayStream>>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<Box<dyn RelayStream>>>,
    stream_config: MockStreamConfig,
    rtt_ms: AtomicU32,
    connection_type: StdMutex<ConnectionType>,
}

/// Create both halves of a connection between `a` and `b`.
pub(crate) fn connection_pair(
    a: NodeId,
    b: NodeId,
    stream_config: MockStreamConfig,
) -> (Arc<MockConnection>, Arc<MockConnection>) {
    let alive = Arc::new(AtomicBool::new(true));
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let half = |local, remote, tx, rx| {
        Arc::new(MockConnection {
            local,
            remote,
            alive: alive.clone(),
            to_peer: StdMutex::new(Some(tx)),
            incoming: Mutex::new(rx),
            stream_config,
            rtt_ms: AtomicU32::new(1),
            connection_type: StdMutex::new(ConnectionType::Relay),
        })
    };
    (half(a, b, a_tx, a_rx), half(b, a, b_tx, b_rx))
}

impl MockConnection {
    /// Abrupt teardown used by fault injection and peer closes.
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.to_peer.lock().expect("peer tx lock").take();
    }

    pub fn set_rtt_ms(&self, rtt: u32) {
        self.rtt_ms.store(rtt, Ordering::SeqCst);
    }

    pub fn set_connection_type(&self, connection_type: ConnectionType) {
        *self.connection_type.lock().expect("type lock") = connection_type;
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local
    }
}

#[async_trait]
impl RelayConnection for MockConnection {
    fn remote_node_id(&self) -> NodeId {
        self.remote
    }

    async fn open_stream(&self) -> Result<Box<dyn RelayStream>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed { peer: self.remote });
        }
        let (near, far) = linked_pair(self.stream_config);
        let delivered = self
            .to_peer
            .lock()
            .expect("peer tx lock")
            .as_ref()
            .map(|tx| tx.send(Box::new(far) as Box<dyn RelayStream>).is_ok())
            .unwrap_or(false);
        if !delivered {
            return Err(TransportError::ConnectionLost { peer: self.remote });
        }
        Ok(Box::new(near))
    }

    async fn accept_stream(&self) -> Result<Box<dyn RelayStream>> {
        match self.incoming.lock().await.recv().await {
            Some(stream) => Ok(stream),
            None => {
                if self.alive.load(Ordering::SeqCst) {
                    Err(TransportError::ConnectionLost { peer: self.remote })
                } else {
                    Err(TransportError::ConnectionClosed { peer: self.remote })
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn rtt_ms(&self) -> u32 {
        self.rtt_ms.load(Ordering::SeqCst)
    }

    fn connection_type(&self) -> ConnectionType {
        *self.connection_type.lock().expect("type lock")
    }

    async fn close(&self) {
        self.kill();
    }
}
