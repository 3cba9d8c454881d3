//! In-memory connection registry
//!
//! One shared map from node id (and its `mock://` ticket) to endpoint,
//! scoped to a [`MockNetwork`] instance so tests get isolated universes.
//! Fault injection lives here: partitions block dials, and active
//! connection pairs can be severed or re-established without going through
//! the transport API.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use peervault_core::{
    EndpointProvider, NodeId, RelayConnection, RelayEndpoint, Result, Ticket, TransportError,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::endpoint::{connection_pair, MockConnection, MockEndpoint};
use crate::stream::MockStreamConfig;

const TICKET_SCHEME: &str = "mock://";

/// Where mock endpoints register to become dialable.
#[async_trait]
pub trait MockRegistry: Send + Sync {
    /// Make `node` dialable; `accept_tx` feeds its accept queue.
    fn register(&self, node: NodeId, accept_tx: mpsc::UnboundedSender<Arc<dyn RelayConnection>>);

    fn unregister(&self, node: &NodeId);

    async fn dial(&self, from: NodeId, ticket: &Ticket) -> Result<Arc<dyn RelayConnection>>;
}

/// Parse a `mock://{64-hex}` coupon.
pub(crate) fn parse_ticket(ticket: &Ticket) -> Result<NodeId> {
    let raw = ticket.as_str();
    let hex = raw
        .strip_prefix(TICKET_SCHEME)
        .ok_or_else(|| TransportError::InvalidTicket(raw.to_string()))?;
    hex.parse::<NodeId>()
        .map_err(|_| TransportError::InvalidTicket(raw.to_string()))
}

struct NetworkInner {
    endpoints: HashMap<NodeId, mpsc::UnboundedSender<Arc<dyn RelayConnection>>>,
    partitions: HashSet<(NodeId, NodeId)>,
    /// Active pairs per unordered node pair, for fault injection.
    pairs: HashMap<(NodeId, NodeId), Vec<(Arc<MockConnection>, Arc<MockConnection>)>>,
    stream_config: MockStreamConfig,
}

/// An isolated single-process mock universe.
#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<StdMutex<NetworkInner>>,
}

fn pair_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(NetworkInner {
                endpoints: HashMap::new(),
                partitions: HashSet::new(),
                pairs: HashMap::new(),
                stream_config: MockStreamConfig::default(),
            })),
        }
    }

    /// Endpoint factory for wiring this network into a transport.
    pub fn provider(&self) -> Arc<dyn EndpointProvider> {
        Arc::new(InMemoryProvider {
            network: self.clone(),
        })
    }

    /// Knobs applied to streams created after this call.
    pub fn set_stream_config(&self, config: MockStreamConfig) {
        self.inner.lock().expect("network lock").stream_config = config;
    }

    /// Block dials between `a` and `b` until healed.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.inner
            .lock()
            .expect("network lock")
            .partitions
            .insert(pair_key(a, b));
    }

    pub fn heal(&self, a: NodeId, b: NodeId) {
        self.inner
            .lock()
            .expect("network lock")
            .partitions
            .remove(&pair_key(a, b));
    }

    /// Sever every active connection between `a` and `b`, bypassing the
    /// transport API.
    pub fn simulate_disconnect(&self, a: NodeId, b: NodeId) {
        let severed = {
            let mut inner = self.inner.lock().expect("network lock");
            inner.pairs.remove(&pair_key(a, b)).unwrap_or_default()
        };
        for (left, right) in severed {
            left.kill();
            right.kill();
        }
    }

    /// Re-establish a connection between `a` and `b` as if both sides had
    /// accepted a fresh dial.
    pub fn simulate_reconnect(&self, a: NodeId, b: NodeId) -> Result<()> {
        let mut inner = self.inner.lock().expect("network lock");
        let (near, far) = connection_pair(a, b, inner.stream_config);

        let deliver = |inner: &NetworkInner, node: &NodeId, conn: Arc<MockConnection>| {
            inner
                .endpoints
                .get(node)
                .and_then(|tx| tx.send(conn as Arc<dyn RelayConnection>).ok())
                .ok_or_else(|| TransportError::ConnectionFailed {
                    peer: node.to_string(),
                    reason: "endpoint not registered".into(),
                })
        };
        deliver(&inner, &a, near.clone())?;
        deliver(&inner, &b, far.clone())?;

        inner
            .pairs
            .entry(pair_key(a, b))
            .or_default()
            .push((near, far));
        Ok(())
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MockRegistry for MockNetwork {
    fn register(&self, node: NodeId, accept_tx: mpsc::UnboundedSender<Arc<dyn RelayConnection>>) {
        self.inner
            .lock()
            .expect("network lock")
            .endpoints
            .insert(node, accept_tx);
    }

    fn unregister(&self, node: &NodeId) {
        self.inner
            .lock()
            .expect("network lock")
            .endpoints
            .remove(node);
    }

    async fn dial(&self, from: NodeId, ticket: &Ticket) -> Result<Arc<dyn RelayConnection>> {
        let target = parse_ticket(ticket)?;
        let mut inner = self.inner.lock().expect("network lock");

        if inner.partitions.contains(&pair_key(from, target)) {
            return Err(TransportError::ConnectionFailed {
                peer: target.to_string(),
                reason: "network partition".into(),
            });
        }

        let accept_tx = inner.endpoints.get(&target).cloned().ok_or_else(|| {
            TransportError::ConnectionFailed {
                peer: target.to_string(),
                reason: "unknown or unreachable node".into(),
            }
        })?;

        let (near, far) = connection_pair(from, target, inner.stream_config);
        accept_tx
            .send(far.clone() as Arc<dyn RelayConnection>)
            .map_err(|_| TransportError::ConnectionFailed {
                peer: target.to_string(),
                reason: "endpoint closed".into(),
            })?;

        inner
            .pairs
            .entry(pair_key(from, target))
            .or_default()
            .push((near.clone(), far));

        debug!(from = %from.fingerprint(), to = %target.fingerprint(), "mock dial connected");
        Ok(near)
    }
}

struct InMemoryProvider {
    network: MockNetwork,
}

#[async_trait]
impl EndpointProvider for InMemoryProvider {
    async fn initialize_runtime(&self) -> Result<()> {
        Ok(())
    }

    async fn create_endpoint(
        &self,
        secret_key: [u8; 32],
        _relay_urls: &[String],
    ) -> Result<Arc<dyn RelayEndpoint>> {
        let registry: Arc<dyn MockRegistry> = Arc::new(self.network.clone());
        Ok(MockEndpoint::bind(secret_key, registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{derive_node_id, ticket_for};
    use peervault_core::RelayEndpoint;

    fn endpoint(network: &MockNetwork, seed: u8) -> Arc<MockEndpoint> {
        let registry: Arc<dyn MockRegistry> = Arc::new(network.clone());
        MockEndpoint::bind([seed; 32], registry)
    }

    #[tokio::test]
    async fn dial_links_two_endpoints() {
        let network = MockNetwork::new();
        let a = endpoint(&network, 1);
        let b = endpoint(&network, 2);

        let a_conn = a.connect_with_ticket(&b.generate_ticket()).await.unwrap();
        let b_conn = b.accept_connection().await.unwrap().unwrap();

        assert_eq!(a_conn.remote_node_id(), b.node_id());
        assert_eq!(b_conn.remote_node_id(), a.node_id());
    }

    #[tokio::test]
    async fn malformed_tickets_are_invalid() {
        let network = MockNetwork::new();
        let a = endpoint(&network, 1);

        let err = a
            .connect_with_ticket(&Ticket::new("invalid"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidTicket(_)));

        let err = a
            .connect_with_ticket(&Ticket::new("mock://nonexistent"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidTicket(_)));
    }

    #[tokio::test]
    async fn unknown_node_fails_to_connect() {
        let network = MockNetwork::new();
        let a = endpoint(&network, 1);
        let ghost = derive_node_id(&[9u8; 32]);

        let err = a.connect_with_ticket(&ticket_for(&ghost)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn partition_blocks_dials_until_healed() {
        let network = MockNetwork::new();
        let a = endpoint(&network, 1);
        let b = endpoint(&network, 2);

        network.partition(a.node_id(), b.node_id());
        let err = a
            .connect_with_ticket(&b.generate_ticket())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));

        network.heal(a.node_id(), b.node_id());
        assert!(a.connect_with_ticket(&b.generate_ticket()).await.is_ok());
    }

    #[tokio::test]
    async fn simulate_disconnect_severs_both_halves() {
        let network = MockNetwork::new();
        let a = endpoint(&network, 1);
        let b = endpoint(&network, 2);

        let a_conn = a.connect_with_ticket(&b.generate_ticket()).await.unwrap();
        let b_conn = b.accept_connection().await.unwrap().unwrap();
        assert!(a_conn.is_connected() && b_conn.is_connected());

        network.simulate_disconnect(a.node_id(), b.node_id());
        assert!(!a_conn.is_connected());
        assert!(!b_conn.is_connected());
    }

    #[tokio::test]
    async fn simulate_reconnect_delivers_to_both_accept_queues() {
        let network = MockNetwork::new();
        let a = endpoint(&network, 1);
        let b = endpoint(&network, 2);

        network.simulate_reconnect(a.node_id(), b.node_id()).unwrap();
        let a_conn = a.accept_connection().await.unwrap().unwrap();
        let b_conn = b.accept_connection().await.unwrap().unwrap();
        assert_eq!(a_conn.remote_node_id(), b.node_id());
        assert_eq!(b_conn.remote_node_id(), a.node_id());
    }
}
