//! Relay transport
//!
//! Endpoint lifecycle and identity persistence, the connection accept loop
//! with exponential backoff and a bounded-crash supervisor, duplicate
//! suppression on both accept and initiate, and shutdown coordinated with
//! the process-wide cleanup set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use peervault_core::{
    EndpointProvider, NodeId, RelayConnection, RelayEndpoint, Result, Ticket, TransportError,
    SECRET_KEY_LEN,
};
use rand::RngCore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{supervise, BackoffSchedule, LoopExit, SuperviseOutcome, MAX_LOOP_CRASHES};
use crate::config::TransportConfig;
use crate::relay_connection::RelayPeerConnection;
use crate::subscription::{SubscriberList, Subscription};

/// Backoff for transient accept errors.
const ACCEPT_ERROR_BACKOFF: BackoffSchedule =
    BackoffSchedule::new(Duration::from_millis(500), Duration::from_secs(30))
        .with_jitter(Duration::from_millis(100));

/// Restart schedule for a crashed connection accept loop.
const ACCEPT_LOOP_BACKOFF: BackoffSchedule =
    BackoffSchedule::new(Duration::from_secs(1), Duration::from_secs(30));

/// The relay-side transport: produces peer connections.
pub struct RelayTransport {
    config: TransportConfig,
    provider: Arc<dyn EndpointProvider>,
    endpoint: StdMutex<Option<Arc<dyn RelayEndpoint>>>,
    ready: AtomicBool,
    /// Replaced on every `initialize` so a reinitialized transport does not
    /// inherit a cancelled token from a previous shutdown.
    cancel: StdMutex<CancellationToken>,
    connections: Arc<StdMutex<HashMap<NodeId, Arc<RelayPeerConnection>>>>,
    conn_subscribers: Arc<SubscriberList<Arc<RelayPeerConnection>>>,
}

impl RelayTransport {
    pub fn new(config: TransportConfig, provider: Arc<dyn EndpointProvider>) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            endpoint: StdMutex::new(None),
            ready: AtomicBool::new(false),
            cancel: StdMutex::new(CancellationToken::new()),
            connections: Arc::new(StdMutex::new(HashMap::new())),
            conn_subscribers: Arc::new(SubscriberList::new()),
        })
    }

    /// One-shot initialization: await outstanding cleanups, warm up the
    /// runtime, load or create the secret key, create the endpoint, and
    /// start the accept loop.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        // A fresh endpoint must never race a teardown from a previous
        // instance (hot reload); drain the cleanup set first.
        crate::runtime::runtime().await_cleanups().await;
        crate::runtime::runtime()
            .ensure_initialized(&self.provider)
            .await?;

        let secret_key = self.load_or_create_key().await?;
        let endpoint = self.create_endpoint(secret_key).await?;

        info!(node = %endpoint.node_id().fingerprint(), "relay transport initialized");
        *self.endpoint.lock().expect("endpoint lock") = Some(endpoint);
        *self.cancel.lock().expect("cancel lock") = CancellationToken::new();
        self.ready.store(true, Ordering::SeqCst);
        self.spawn_accept_loop();
        Ok(())
    }

    async fn load_or_create_key(&self) -> Result<[u8; SECRET_KEY_LEN]> {
        match self.config.storage.load_secret_key().await? {
            Some(bytes) if bytes.len() == SECRET_KEY_LEN => {
                let mut key = [0u8; SECRET_KEY_LEN];
                key.copy_from_slice(&bytes);
                Ok(key)
            }
            other => {
                if other.is_some() {
                    warn!("stored secret key has wrong length, regenerating");
                }
                let mut key = [0u8; SECRET_KEY_LEN];
                rand::thread_rng().fill_bytes(&mut key);
                // Persist before the endpoint exists so a crash mid-init
                // cannot fork the identity.
                self.config.storage.save_secret_key(&key).await?;
                Ok(key)
            }
        }
    }

    async fn create_endpoint(&self, key: [u8; SECRET_KEY_LEN]) -> Result<Arc<dyn RelayEndpoint>> {
        let runtime = crate::runtime::runtime();
        runtime.endpoint_created();

        let result = match self
            .provider
            .create_endpoint(key, &self.config.relay_urls)
            .await
        {
            Ok(endpoint) => Ok(endpoint),
            Err(e) if !self.config.relay_urls.is_empty() => {
                warn!(error = %e, "endpoint creation with custom relays failed, retrying defaults");
                self.provider.create_endpoint(key, &[]).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                runtime.endpoint_released();
                Err(map_endpoint_error(e))
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> Result<NodeId> {
        self.with_endpoint(|e| e.node_id())
    }

    pub fn generate_ticket(&self) -> Result<Ticket> {
        self.with_endpoint(|e| e.generate_ticket())
    }

    /// Diagnostics: endpoints alive in this process.
    pub fn active_endpoint_count(&self) -> usize {
        crate::runtime::runtime().active_endpoint_count()
    }

    fn with_endpoint<T>(&self, f: impl FnOnce(&Arc<dyn RelayEndpoint>) -> T) -> Result<T> {
        let endpoint = self.endpoint.lock().expect("endpoint lock");
        match endpoint.as_ref() {
            Some(e) => Ok(f(e)),
            None => Err(TransportError::NotInitialized),
        }
    }

    /// Dial a peer. If a live connection to that node already exists, the
    /// dialed handle is closed and the existing connection returned.
    pub async fn connect_with_ticket(&self, ticket: &Ticket) -> Result<Arc<RelayPeerConnection>> {
        let endpoint = self.with_endpoint(Arc::clone)?;
        let raw = endpoint.connect_with_ticket(ticket).await?;
        let peer = raw.remote_node_id();

        if let Some(existing) = self.get_connection(&peer) {
            debug!(peer = %peer.fingerprint(), "duplicate dial suppressed, reusing live connection");
            raw.close().await;
            return Ok(existing);
        }

        let conn = RelayPeerConnection::new(raw);
        self.insert_connection(conn.clone());
        Ok(conn)
    }

    /// Subscribe to incoming connections. Handlers run synchronously in
    /// registration order before the accept loop continues.
    pub fn on_connection<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Arc<RelayPeerConnection>) + Send + Sync + 'static,
    {
        self.conn_subscribers.subscribe(handler)
    }

    /// Liveness-filtered lookup: a disconnected entry is never returned.
    pub fn get_connection(&self, peer: &NodeId) -> Option<Arc<RelayPeerConnection>> {
        self.connections
            .lock()
            .expect("connections lock")
            .get(peer)
            .filter(|c| c.state().is_live())
            .cloned()
    }

    /// All live connections.
    pub fn connections(&self) -> Vec<Arc<RelayPeerConnection>> {
        self.connections
            .lock()
            .expect("connections lock")
            .values()
            .filter(|c| c.state().is_live())
            .cloned()
            .collect()
    }

    fn insert_connection(&self, conn: Arc<RelayPeerConnection>) {
        self.connections
            .lock()
            .expect("connections lock")
            .insert(conn.peer_id(), conn);
    }

    /// Graceful shutdown: stop accepting, close every connection, free the
    /// endpoint, and track the cleanup in the process-wide set until done.
    pub async fn shutdown(&self) {
        if !self.ready.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.lock().expect("cancel lock").cancel();

        let endpoint = self.endpoint.lock().expect("endpoint lock").take();
        let connections: Vec<Arc<RelayPeerConnection>> = {
            let mut map = self.connections.lock().expect("connections lock");
            map.drain().map(|(_, c)| c).collect()
        };
        self.conn_subscribers.clear();

        let cleanup = async move {
            for conn in connections {
                conn.close().await;
            }
            if let Some(endpoint) = endpoint {
                endpoint.close().await;
            }
            crate::runtime::runtime().endpoint_released();
            info!("relay transport shut down");
        }
        .boxed();

        let tracked = crate::runtime::runtime().register_cleanup(cleanup);
        tracked.await;
    }

    fn spawn_accept_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let loop_this = this.clone();
            let outcome = supervise(
                "connection-accept",
                ACCEPT_LOOP_BACKOFF,
                MAX_LOOP_CRASHES,
                move || {
                    let this = loop_this.clone();
                    async move { this.accept_loop_once().await }
                },
            )
            .await;
            if outcome == SuperviseOutcome::GaveUp {
                warn!("connection accept loop gave up; no further incoming connections");
            }
        });
    }

    async fn accept_loop_once(self: Arc<Self>) -> LoopExit {
        let endpoint = match self.with_endpoint(Arc::clone) {
            Ok(e) => e,
            Err(_) => return LoopExit::Clean,
        };
        let cancel = self.cancel.lock().expect("cancel lock").clone();

        let mut consecutive_errors: u32 = 0;
        loop {
            if !self.ready.load(Ordering::SeqCst) {
                return LoopExit::Clean;
            }

            let accepted = tokio::select! {
                _ = cancel.cancelled() => return LoopExit::Clean,
                accepted = endpoint.accept_connection() => accepted,
            };

            match accepted {
                // Spurious wake while still ready; keep accepting.
                Ok(None) => continue,
                Ok(Some(raw)) => {
                    consecutive_errors = 0;
                    self.handle_incoming(raw).await;
                }
                Err(e) => {
                    if !self.ready.load(Ordering::SeqCst) {
                        return LoopExit::Clean;
                    }
                    consecutive_errors += 1;
                    let delay = ACCEPT_ERROR_BACKOFF.delay(consecutive_errors);
                    warn!(
                        error = %e,
                        attempt = consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "accept failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn handle_incoming(&self, raw: Arc<dyn RelayConnection>) {
        let peer = raw.remote_node_id();

        if self.get_connection(&peer).is_some() {
            // Idempotent duplicate suppression: newcomer is closed and freed.
            debug!(peer = %peer.fingerprint(), "duplicate incoming connection rejected");
            raw.close().await;
            return;
        }

        info!(peer = %peer.fingerprint(), "accepted relay connection");
        let conn = RelayPeerConnection::new(raw);
        self.insert_connection(conn.clone());
        self.conn_subscribers.notify_all(conn);
    }
}

/// Translate endpoint-creation failures, surfacing out-of-memory signatures
/// with a user-facing hint.
fn map_endpoint_error(e: TransportError) -> TransportError {
    let text = e.to_string().to_lowercase();
    if text.contains("out of memory") || text.contains("memory exhausted") {
        TransportError::RuntimeMemoryExhausted {
            hint: "the relay runtime ran out of memory; close other tabs or restart the host"
                .to_string(),
        }
    } else {
        e
    }
}
