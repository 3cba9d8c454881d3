//! Relay peer connection
//!
//! Owns one opaque relay connection handle: outgoing streams by id, a
//! pending-incoming queue with paired accept waiters, persistent stream
//! subscribers under the single-owner policy, and a supervised stream accept
//! loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use peervault_core::{
    ConnectionState, ConnectionType, NodeId, RelayConnection, Result, TransportError,
};
use tracing::{debug, info, warn};

use crate::backoff::{supervise, BackoffSchedule, LoopExit, SuperviseOutcome, MAX_LOOP_CRASHES};
use crate::dispatch::StreamDispatcher;
use crate::stream::{PeerStream, RelayBackedStream, StreamShared};
use crate::subscription::{SubscriberList, Subscription};

/// Restart schedule for a crashed stream accept loop.
const STREAM_LOOP_BACKOFF: BackoffSchedule =
    BackoffSchedule::new(Duration::from_millis(500), Duration::from_secs(15));

/// One logical link to a single peer over the relay path.
pub struct RelayPeerConnection {
    peer_id: NodeId,
    conn: Arc<dyn RelayConnection>,
    state: StdMutex<ConnectionState>,
    state_subscribers: SubscriberList<ConnectionState>,
    dispatcher: StreamDispatcher,
    /// Live stream close-handles by id, so teardown reaches streams callers
    /// still hold.
    streams: StdMutex<HashMap<String, Arc<StreamShared>>>,
    out_counter: AtomicU64,
    in_counter: AtomicU64,
    closed: AtomicBool,
}

impl RelayPeerConnection {
    /// Wrap an established relay connection and start its stream accept loop.
    pub fn new(conn: Arc<dyn RelayConnection>) -> Arc<Self> {
        let peer_id = conn.remote_node_id();
        let this = Arc::new(Self {
            peer_id,
            conn,
            state: StdMutex::new(ConnectionState::Connected),
            state_subscribers: SubscriberList::new(),
            dispatcher: StreamDispatcher::new(),
            streams: StdMutex::new(HashMap::new()),
            out_counter: AtomicU64::new(0),
            in_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        this.spawn_stream_loop();
        this
    }

    pub fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    /// Round-trip time in milliseconds, when the relay knows it.
    pub fn rtt_ms(&self) -> Option<u32> {
        match self.conn.rtt_ms() {
            0 => None,
            rtt => Some(rtt),
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.conn.connection_type()
    }

    pub fn pending_stream_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Open a new outgoing stream. Requires `Connected`.
    pub async fn open_stream(&self) -> Result<Arc<dyn PeerStream>> {
        if !self.state().is_live() {
            return Err(TransportError::ConnectionClosed { peer: self.peer_id });
        }
        let raw = self.conn.open_stream().await?;
        let n = self.out_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-out-{}", self.peer_id, n);
        let stream = RelayBackedStream::new(id.clone(), raw);
        self.streams
            .lock()
            .expect("streams lock")
            .insert(id, stream.shared());
        Ok(stream)
    }

    /// Pop a queued incoming stream or park until one arrives.
    pub async fn accept_stream(&self) -> Result<Arc<dyn PeerStream>> {
        if !self.state().is_live() {
            return Err(TransportError::ConnectionClosed { peer: self.peer_id });
        }
        self.dispatcher.accept().await
    }

    /// Register a persistent incoming-stream subscriber (single-owner
    /// policy; the first subscriber also receives the queued backlog).
    pub fn on_stream<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Arc<dyn PeerStream>) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(handler)
    }

    /// Subscribe to connection state transitions.
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.state_subscribers.subscribe(handler)
    }

    /// Idempotent teardown: closes live and pending streams, rejects accept
    /// waiters, clears subscribers, and closes the underlying connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.peer_id.fingerprint(), "closing relay peer connection");
        self.teardown(
            ConnectionState::Disconnected,
            TransportError::ConnectionClosed { peer: self.peer_id },
        );
        self.conn.close().await;
    }

    /// The connection died underneath us.
    fn mark_lost(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown(
            ConnectionState::Disconnected,
            TransportError::ConnectionLost { peer: self.peer_id },
        );
    }

    fn teardown(&self, final_state: ConnectionState, reason: TransportError) {
        self.set_state(final_state);

        let handles: Vec<Arc<StreamShared>> = {
            let mut streams = self.streams.lock().expect("streams lock");
            streams.drain().map(|(_, shared)| shared).collect()
        };
        for shared in handles {
            shared.close_with(Some(reason.clone()));
        }

        let backlog = self.dispatcher.shut_down(reason);
        for stream in backlog {
            let stream = stream.clone();
            tokio::spawn(async move {
                let _ = stream.close().await;
            });
        }
        self.state_subscribers.clear();
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.lock().expect("state lock");
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            self.state_subscribers.notify_all(next);
        }
    }

    /// Background task accepting incoming streams while connected. Crashes
    /// are restarted by a supervisor; after the budget is spent the
    /// connection is force-disconnected.
    fn spawn_stream_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let loop_this = this.clone();
            let outcome = supervise(
                "stream-accept",
                STREAM_LOOP_BACKOFF,
                MAX_LOOP_CRASHES,
                move || {
                    let this = loop_this.clone();
                    async move { this.stream_loop_once().await }
                },
            )
            .await;
            if outcome == SuperviseOutcome::GaveUp {
                warn!(
                    peer = %this.peer_id.fingerprint(),
                    "stream accept loop crash budget spent, force-disconnecting"
                );
                this.mark_lost();
            }
        });
    }

    async fn stream_loop_once(self: Arc<Self>) -> LoopExit {
        loop {
            if !self.state().is_live() {
                return LoopExit::Clean;
            }
            match self.conn.accept_stream().await {
                Ok(raw) => {
                    let n = self.in_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    let id = format!("{}-in-{}", self.peer_id, n);
                    debug!(stream = %id, "accepted incoming relay stream");
                    let stream = RelayBackedStream::new(id.clone(), raw);
                    self.streams
                        .lock()
                        .expect("streams lock")
                        .insert(id, stream.shared());
                    self.dispatcher.dispatch(stream);
                }
                Err(e) => {
                    if self.state().is_live() {
                        warn!(
                            peer = %self.peer_id.fingerprint(),
                            error = %e,
                            "stream accept failed, marking connection lost"
                        );
                        self.mark_lost();
                    }
                    return LoopExit::Clean;
                }
            }
        }
    }
}
