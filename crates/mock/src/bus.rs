//! Cross-process mock registry
//!
//! Two independently running host instances can mock-connect when they
//! share nothing but a broadcast bus. Every interaction crosses the bus as
//! a serialized JSON frame with a base64 payload, so the full
//! serialization boundary is exercised:
//!
//! `connect-request / connect-accept / connect-reject / stream-open /
//! stream-opened / stream-data / stream-close / disconnect`
//!
//! Each registry instance plays one "process": it owns the local routing
//! state (connections by peer, stream feeds by id) and a listener task that
//! reacts to frames addressed to its nodes. Frames are broadcast, so every
//! lookup is direction-checked against the frame's `to_node_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use peervault_core::{
    ConnectionType, EndpointProvider, NodeId, RelayConnection, RelayEndpoint, RelayStream, Result,
    Ticket, TransportError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::endpoint::MockEndpoint;
use crate::registry::{parse_ticket, MockRegistry};

/// Bound on waiting for a connect or stream-open acknowledgment.
const BUS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
/// Frame backlog per subscriber before lagging.
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum BusMessageKind {
    ConnectRequest,
    ConnectAccept,
    ConnectReject,
    StreamOpen,
    StreamOpened,
    StreamData,
    StreamClose,
    Disconnect,
}

/// One frame on the bus. Stringly typed on purpose: this is the
/// serialization boundary between "processes".
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BusFrame {
    #[serde(rename = "type")]
    kind: BusMessageKind,
    from_node_id: String,
    to_node_id: String,
    request_id: String,
    stream_id: String,
    /// base64-encoded bytes; empty when the kind carries none.
    payload: String,
}

impl BusFrame {
    fn new(kind: BusMessageKind, from: NodeId, to: NodeId) -> Self {
        Self {
            kind,
            from_node_id: from.to_string(),
            to_node_id: to.to_string(),
            request_id: String::new(),
            stream_id: String::new(),
            payload: String::new(),
        }
    }

    fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = request_id.to_string();
        self
    }

    fn with_stream_id(mut self, stream_id: &str) -> Self {
        self.stream_id = stream_id.to_string();
        self
    }

    fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = BASE64.encode(payload);
        self
    }
}

/// The shared broadcast channel standing in for an inter-process bus.
#[derive(Clone)]
pub struct CrossProcessBus {
    tx: broadcast::Sender<String>,
}

impl CrossProcessBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    fn publish(&self, frame: &BusFrame) {
        match serde_json::to_string(frame) {
            // No subscribers is fine; the frame just goes nowhere.
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => warn!(error = %e, "failed to serialize bus frame"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for CrossProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing state for one registry instance ("process").
#[derive(Default)]
struct BusState {
    /// Local accept queues by registered node.
    endpoints: HashMap<NodeId, mpsc::UnboundedSender<Arc<dyn RelayConnection>>>,
    /// Established connections by (local, remote).
    connections: HashMap<(NodeId, NodeId), Arc<BusConnection>>,
    /// Inbound feeds by (stream id, local node). Direction-keyed: the
    /// opener and acceptor of one stream hold feeds under different nodes.
    streams: HashMap<(String, NodeId), mpsc::UnboundedSender<Vec<u8>>>,
    /// Dials awaiting connect-accept / connect-reject, by request id.
    pending_connects: HashMap<String, oneshot::Sender<bool>>,
    /// Stream opens awaiting stream-opened, by stream id.
    pending_streams: HashMap<String, oneshot::Sender<()>>,
}

/// A registry whose members talk only through the bus.
pub struct CrossProcessRegistry {
    bus: CrossProcessBus,
    state: Arc<StdMutex<BusState>>,
    ids: AtomicU64,
}

impl CrossProcessRegistry {
    pub fn new(bus: CrossProcessBus) -> Arc<Self> {
        let this = Arc::new(Self {
            bus,
            state: Arc::new(StdMutex::new(BusState::default())),
            ids: AtomicU64::new(1),
        });
        this.spawn_listener();
        this
    }

    /// Endpoint factory for wiring this registry into a transport.
    pub fn provider(self: &Arc<Self>) -> Arc<dyn EndpointProvider> {
        Arc::new(BusProvider {
            registry: self.clone(),
        })
    }

    fn next_id(&self, node: &NodeId) -> String {
        format!(
            "{}-{}",
            node.fingerprint(),
            self.ids.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn spawn_listener(self: &Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let json = match rx.recv().await {
                    Ok(json) => json,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "bus listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(this) = weak.upgrade() else { return };
                match serde_json::from_str::<BusFrame>(&json) {
                    Ok(frame) => this.handle_frame(frame),
                    Err(e) => warn!(error = %e, "undecodable bus frame"),
                }
            }
        });
    }

    fn handle_frame(self: &Arc<Self>, frame: BusFrame) {
        let (Ok(to), Ok(from)) = (
            frame.to_node_id.parse::<NodeId>(),
            frame.from_node_id.parse::<NodeId>(),
        ) else {
            return;
        };

        match frame.kind {
            BusMessageKind::ConnectRequest => self.on_connect_request(from, to, &frame),
            BusMessageKind::ConnectAccept | BusMessageKind::ConnectReject => {
                let accepted = frame.kind == BusMessageKind::ConnectAccept;
                let waiter = self
                    .state
                    .lock()
                    .expect("bus state lock")
                    .pending_connects
                    .remove(&frame.request_id);
                // Only the dialing process holds this pending entry.
                if let Some(tx) = waiter {
                    if accepted {
                        self.install_connection(to, from);
                    }
                    let _ = tx.send(accepted);
                }
            }
            BusMessageKind::StreamOpen => self.on_stream_open(from, to, &frame),
            BusMessageKind::StreamOpened => {
                let waiter = self
                    .state
                    .lock()
                    .expect("bus state lock")
                    .pending_streams
                    .remove(&frame.stream_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(());
                }
            }
            BusMessageKind::StreamData => {
                let feed = self
                    .state
                    .lock()
                    .expect("bus state lock")
                    .streams
                    .get(&(frame.stream_id.clone(), to))
                    .cloned();
                if let Some(feed) = feed {
                    match BASE64.decode(frame.payload.as_bytes()) {
                        Ok(bytes) => {
                            let _ = feed.send(bytes);
                        }
                        Err(e) => warn!(error = %e, "undecodable stream payload"),
                    }
                }
            }
            BusMessageKind::StreamClose => {
                self.state
                    .lock()
                    .expect("bus state lock")
                    .streams
                    .remove(&(frame.stream_id.clone(), to));
            }
            BusMessageKind::Disconnect => {
                let conn = self
                    .state
                    .lock()
                    .expect("bus state lock")
                    .connections
                    .remove(&(to, from));
                if let Some(conn) = conn {
                    conn.sever();
                }
            }
        }
    }

    /// Acceptor side of a dial: build the local connection object, queue it
    /// for accept, and acknowledge.
    fn on_connect_request(self: &Arc<Self>, from: NodeId, to: NodeId, frame: &BusFrame) {
        let accept_tx = self
            .state
            .lock()
            .expect("bus state lock")
            .endpoints
            .get(&to)
            .cloned();
        let Some(accept_tx) = accept_tx else {
            // Not our node (or endpoint gone): other registries stay quiet
            // so an unreachable target times out on the dialer.
            return;
        };

        let conn = self.install_connection(to, from);
        let reply = if accept_tx.send(conn as Arc<dyn RelayConnection>).is_ok() {
            BusMessageKind::ConnectAccept
        } else {
            BusMessageKind::ConnectReject
        };
        self.bus
            .publish(&BusFrame::new(reply, to, from).with_request_id(&frame.request_id));
    }

    /// Register (or fetch) the connection object for a (local, remote) link.
    fn install_connection(self: &Arc<Self>, local: NodeId, remote: NodeId) -> Arc<BusConnection> {
        let mut state = self.state.lock().expect("bus state lock");
        if let Some(existing) = state.connections.get(&(local, remote)) {
            return existing.clone();
        }
        let conn = BusConnection::new(local, remote, self.clone());
        state.connections.insert((local, remote), conn.clone());
        conn
    }

    /// Peer opened a stream toward us: install its inbound feed, hand the
    /// stream to the owning connection, and acknowledge.
    fn on_stream_open(self: &Arc<Self>, from: NodeId, to: NodeId, frame: &BusFrame) {
        let conn = self
            .state
            .lock()
            .expect("bus state lock")
            .connections
            .get(&(to, from))
            .cloned();
        let Some(conn) = conn else {
            debug!("stream-open for a connection we do not own, ignoring");
            return;
        };

        let stream = self.build_stream(to, from, frame.stream_id.clone());
        conn.queue_incoming(Box::new(stream));

        self.bus.publish(
            &BusFrame::new(BusMessageKind::StreamOpened, to, from)
                .with_request_id(&frame.request_id)
                .with_stream_id(&frame.stream_id),
        );
    }

    fn build_stream(&self, local: NodeId, remote: NodeId, stream_id: String) -> BusStream {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .expect("bus state lock")
            .streams
            .insert((stream_id.clone(), local), feed_tx);
        BusStream {
            stream_id,
            local,
            remote,
            bus: self.bus.clone(),
            state: self.state.clone(),
            rx: feed_rx,
            closed: false,
        }
    }

    async fn open_stream_over_bus(
        self: &Arc<Self>,
        local: NodeId,
        remote: NodeId,
    ) -> Result<BusStream> {
        let stream_id = self.next_id(&local);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.state
            .lock()
            .expect("bus state lock")
            .pending_streams
            .insert(stream_id.clone(), ack_tx);

        // Install the inbound feed before announcing the stream, so data
        // frames racing the acknowledgment are not dropped.
        let stream = self.build_stream(local, remote, stream_id.clone());

        self.bus.publish(
            &BusFrame::new(BusMessageKind::StreamOpen, local, remote)
                .with_request_id(&stream_id)
                .with_stream_id(&stream_id),
        );

        match tokio::time::timeout(BUS_HANDSHAKE_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => Ok(stream),
            _ => {
                let mut state = self.state.lock().expect("bus state lock");
                state.pending_streams.remove(&stream_id);
                state.streams.remove(&(stream_id.clone(), local));
                Err(TransportError::ConnectionLost { peer: remote })
            }
        }
    }

    async fn dial_impl(
        self: &Arc<Self>,
        from: NodeId,
        target: NodeId,
    ) -> Result<Arc<dyn RelayConnection>> {
        let request_id = self.next_id(&from);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.state
            .lock()
            .expect("bus state lock")
            .pending_connects
            .insert(request_id.clone(), ack_tx);

        self.bus.publish(
            &BusFrame::new(BusMessageKind::ConnectRequest, from, target)
                .with_request_id(&request_id),
        );

        match tokio::time::timeout(BUS_HANDSHAKE_TIMEOUT, ack_rx).await {
            Ok(Ok(true)) => {
                let conn = self.install_connection(from, target);
                Ok(conn as Arc<dyn RelayConnection>)
            }
            Ok(Ok(false)) => Err(TransportError::ConnectionFailed {
                peer: target.to_string(),
                reason: "connect rejected".into(),
            }),
            _ => {
                self.state
                    .lock()
                    .expect("bus state lock")
                    .pending_connects
                    .remove(&request_id);
                Err(TransportError::ConnectionFailed {
                    peer: target.to_string(),
                    reason: "no response on bus".into(),
                })
            }
        }
    }
}

/// A relay connection whose peer lives across the bus.
pub struct BusConnection {
    local: NodeId,
    remote: NodeId,
    registry: Arc<CrossProcessRegistry>,
    alive: AtomicBool,
    incoming_tx: StdMutex<Option<mpsc::UnboundedSender<Box<dyn RelayStream>>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<Box<dyn RelayStream>>>,
}

impl BusConnection {
    fn new(local: NodeId, remote: NodeId, registry: Arc<CrossProcessRegistry>) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local,
            remote,
            registry,
            alive: AtomicBool::new(true),
            incoming_tx: StdMutex::new(Some(incoming_tx)),
            incoming: Mutex::new(incoming_rx),
        })
    }

    fn queue_incoming(&self, stream: Box<dyn RelayStream>) {
        if let Some(tx) = self.incoming_tx.lock().expect("incoming lock").as_ref() {
            let _ = tx.send(stream);
        }
    }

    /// Local teardown without notifying the peer (it told us). Ends the
    /// accept feed so a parked `accept_stream` observes the closure.
    fn sever(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.incoming_tx.lock().expect("incoming lock").take();
    }
}

#[async_trait]
impl RelayConnection for BusConnection {
    fn remote_node_id(&self) -> NodeId {
        self.remote
    }

    async fn open_stream(&self) -> Result<Box<dyn RelayStream>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed { peer: self.remote });
        }
        let stream = self
            .registry
            .open_stream_over_bus(self.local, self.remote)
            .await?;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> Result<Box<dyn RelayStream>> {
        match self.incoming.lock().await.recv().await {
            Some(stream) => Ok(stream),
            None => Err(TransportError::ConnectionClosed { peer: self.remote }),
        }
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn rtt_ms(&self) -> u32 {
        // The bus has no latency model; unknown.
        0
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Relay
    }

    async fn close(&self) {
        if self.alive.load(Ordering::SeqCst) {
            self.sever();
            self.registry.bus.publish(&BusFrame::new(
                BusMessageKind::Disconnect,
                self.local,
                self.remote,
            ));
            self.registry
                .state
                .lock()
                .expect("bus state lock")
                .connections
                .remove(&(self.local, self.remote));
        }
    }
}

/// A stream whose bytes cross the bus as base64 frames.
pub struct BusStream {
    stream_id: String,
    local: NodeId,
    remote: NodeId,
    bus: CrossProcessBus,
    state: Arc<StdMutex<BusState>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: bool,
}

#[async_trait]
impl RelayStream for BusStream {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransportError::StreamClosed {
                stream_id: self.stream_id.clone(),
            });
        }
        self.bus.publish(
            &BusFrame::new(BusMessageKind::StreamData, self.local, self.remote)
                .with_stream_id(&self.stream_id)
                .with_payload(data),
        );
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::StreamClosed {
                stream_id: self.stream_id.clone(),
            })
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.bus.publish(
                &BusFrame::new(BusMessageKind::StreamClose, self.local, self.remote)
                    .with_stream_id(&self.stream_id),
            );
            self.state
                .lock()
                .expect("bus state lock")
                .streams
                .remove(&(self.stream_id.clone(), self.local));
        }
        Ok(())
    }
}

struct BusProvider {
    registry: Arc<CrossProcessRegistry>,
}

#[async_trait]
impl EndpointProvider for BusProvider {
    async fn initialize_runtime(&self) -> Result<()> {
        Ok(())
    }

    async fn create_endpoint(
        &self,
        secret_key: [u8; 32],
        _relay_urls: &[String],
    ) -> Result<Arc<dyn RelayEndpoint>> {
        let registry: Arc<dyn MockRegistry> = Arc::new(BusRegistryHandle {
            registry: self.registry.clone(),
        });
        Ok(MockEndpoint::bind(secret_key, registry))
    }
}

/// `MockRegistry` adapter holding the `Arc` so endpoint dials reach the
/// listener's routing state.
struct BusRegistryHandle {
    registry: Arc<CrossProcessRegistry>,
}

#[async_trait]
impl MockRegistry for BusRegistryHandle {
    fn register(&self, node: NodeId, accept_tx: mpsc::UnboundedSender<Arc<dyn RelayConnection>>) {
        self.registry
            .state
            .lock()
            .expect("bus state lock")
            .endpoints
            .insert(node, accept_tx);
    }

    fn unregister(&self, node: &NodeId) {
        let mut state = self.registry.state.lock().expect("bus state lock");
        state.endpoints.remove(node);
        state.connections.retain(|(local, _), _| local != node);
    }

    async fn dial(&self, from: NodeId, ticket: &Ticket) -> Result<Arc<dyn RelayConnection>> {
        let target = parse_ticket(ticket)?;
        self.registry.dial_impl(from, target).await
    }
}
