//! Hybrid transport
//!
//! Thin wrapper over the relay transport: every outgoing or incoming peer
//! connection is wrapped in a hybrid connection, and when WebRTC is enabled
//! an opportunistic upgrade is scheduled off the critical path of returning
//! the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use peervault_core::{EndpointProvider, NodeId, Result, Ticket};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::hybrid::HybridConnection;
use crate::relay_connection::RelayPeerConnection;
use crate::relay_transport::RelayTransport;
use crate::subscription::{SubscriberList, Subscription};
use crate::webrtc::webrtc_available;

/// Short debounce before the opportunistic upgrade, so connection setup
/// returns first.
const UPGRADE_DEBOUNCE: Duration = Duration::from_millis(250);

/// The top-level transport: produces hybrid connections.
pub struct HybridTransport {
    relay: Arc<RelayTransport>,
    config: TransportConfig,
    connections: StdMutex<HashMap<NodeId, Arc<HybridConnection>>>,
    conn_subscribers: Arc<SubscriberList<Arc<HybridConnection>>>,
    accept_sub: StdMutex<Option<Subscription>>,
}

impl HybridTransport {
    pub fn new(config: TransportConfig, provider: Arc<dyn EndpointProvider>) -> Arc<Self> {
        let relay = RelayTransport::new(config.clone(), provider);
        Arc::new(Self {
            relay,
            config,
            connections: StdMutex::new(HashMap::new()),
            conn_subscribers: Arc::new(SubscriberList::new()),
            accept_sub: StdMutex::new(None),
        })
    }

    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.relay.initialize().await?;

        // (Re)attach the incoming-connection hook; the relay clears its
        // subscriber list on shutdown.
        let weak = Arc::downgrade(self);
        let sub = self.relay.on_connection(move |conn| {
            if let Some(this) = weak.upgrade() {
                this.adopt(conn, true);
            }
        });
        *self.accept_sub.lock().expect("accept sub lock") = Some(sub);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.connections.lock().expect("connections lock").clear();
        self.relay.shutdown().await;
    }

    pub fn node_id(&self) -> Result<NodeId> {
        self.relay.node_id()
    }

    pub fn generate_ticket(&self) -> Result<Ticket> {
        self.relay.generate_ticket()
    }

    /// Whether this build can construct a WebRTC stack at all.
    pub fn is_webrtc_available(&self) -> bool {
        webrtc_available()
    }

    pub async fn connect_with_ticket(self: &Arc<Self>, ticket: &Ticket) -> Result<Arc<HybridConnection>> {
        let relay_conn = self.relay.connect_with_ticket(ticket).await?;
        Ok(self.adopt(relay_conn, false))
    }

    /// Subscribe to incoming hybrid connections.
    pub fn on_connection<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Arc<HybridConnection>) + Send + Sync + 'static,
    {
        self.conn_subscribers.subscribe(handler)
    }

    /// Liveness-filtered lookup.
    pub fn get_connection(&self, peer: &NodeId) -> Option<Arc<HybridConnection>> {
        self.connections
            .lock()
            .expect("connections lock")
            .get(peer)
            .filter(|c| c.state().is_live())
            .cloned()
    }

    /// All live connections.
    pub fn connections(&self) -> Vec<Arc<HybridConnection>> {
        self.connections
            .lock()
            .expect("connections lock")
            .values()
            .filter(|c| c.state().is_live())
            .cloned()
            .collect()
    }

    /// Wrap a relay connection (or return the existing wrapper when the
    /// relay deduplicated the dial), register it, and schedule the
    /// opportunistic upgrade.
    fn adopt(self: &Arc<Self>, relay_conn: Arc<RelayPeerConnection>, incoming: bool) -> Arc<HybridConnection> {
        let peer = relay_conn.peer_id();

        let (conn, fresh) = {
            let mut map = self.connections.lock().expect("connections lock");
            match map.get(&peer) {
                // Same underlying relay connection: already wrapped.
                Some(existing)
                    if existing.state().is_live()
                        && Arc::ptr_eq(existing.relay(), &relay_conn) =>
                {
                    (existing.clone(), false)
                }
                _ => {
                    let hybrid = HybridConnection::new(
                        relay_conn,
                        self.config.enable_webrtc,
                        self.config.webrtc.clone(),
                    );
                    map.insert(peer, hybrid.clone());
                    (hybrid, true)
                }
            }
        };

        if fresh {
            if incoming {
                self.conn_subscribers.notify_all(conn.clone());
            }
            self.schedule_upgrade(&conn);
        }
        conn
    }

    /// Debounced opportunistic upgrade. Only the side with the greater node
    /// id initiates, so simultaneous attempts cannot reject each other.
    fn schedule_upgrade(&self, conn: &Arc<HybridConnection>) {
        if !self.config.enable_webrtc || !webrtc_available() {
            return;
        }
        let Ok(local) = self.relay.node_id() else {
            return;
        };
        if local <= conn.peer_id() {
            debug!(peer = %conn.peer_id().fingerprint(), "peer initiates upgrades for this pair");
            return;
        }

        let conn = conn.clone();
        tokio::spawn(async move {
            sleep(UPGRADE_DEBOUNCE).await;
            if !conn.state().is_live() {
                return;
            }
            match conn.attempt_upgrade().await {
                Ok(true) => {}
                Ok(false) => debug!("opportunistic upgrade skipped"),
                Err(e) => warn!(error = %e, "opportunistic upgrade failed, staying on relay"),
            }
        });
    }
}
