//! Hybrid connection: relay always, WebRTC when upgraded
//!
//! Composes a relay peer connection with at most one WebRTC peer connection
//! and runs the upgrade state machine over a signaling stream opened on the
//! relay:
//!
//! ```text
//! NotUpgraded -- opens signaling stream --> Signaling
//! Signaling   -- reject / timeout / error --> NotUpgraded (reject is terminal)
//! Signaling   -- SDP + ICE + Ready both sides --> Upgraded
//! Upgraded    -- WebRTC fails or closes --> NotUpgraded (continue on relay)
//! any         -- relay disconnects --> Disconnected (WebRTC torn down)
//! ```
//!
//! The relay connection is authoritative for liveness and identity: a failed
//! upgrade never touches it, and losing it kills the hybrid even if WebRTC
//! is still open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use peervault_core::{ConnectionState, NodeId, Result, TransportError};
use peervault_signaling::{decode, encode, SignalingBody, SignalingMessage};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::WebRtcConfig;
use crate::demux::{peek_and_classify, StreamClass};
use crate::dispatch::StreamDispatcher;
use crate::relay_connection::RelayPeerConnection;
use crate::stream::PeerStream;
use crate::subscription::Subscription;
use crate::webrtc::{webrtc_available, WebRtcPeerConnection};

/// Where the upgrade state machine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    NotUpgraded,
    Signaling,
    Upgraded,
}

/// Which path an incoming stream arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKind {
    Relay,
    WebRtc,
}

impl std::fmt::Debug for HybridConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridConnection").finish_non_exhaustive()
    }
}

/// A connection that rides the relay by default and a direct WebRTC path
/// once upgraded.
pub struct HybridConnection {
    relay: Arc<RelayPeerConnection>,
    enable_webrtc: bool,
    webrtc_config: WebRtcConfig,
    webrtc: StdMutex<Option<Arc<WebRtcPeerConnection>>>,
    upgrade_state: StdMutex<UpgradeState>,
    upgrade_in_flight: AtomicBool,
    /// A recorded rejection is terminal for this connection.
    reject_reason: StdMutex<Option<String>>,
    /// At most one signaling stream exists at any time.
    signaling_stream: StdMutex<Option<Arc<dyn PeerStream>>>,
    /// App-facing sync streams from both paths. Each stream object arrives
    /// from exactly one path, so identity-level de-duplication is structural.
    dispatcher: Arc<StreamDispatcher>,
    /// Keeps the relay stream/state subscriptions alive.
    relay_subs: StdMutex<Vec<Subscription>>,
}

impl HybridConnection {
    pub fn new(
        relay: Arc<RelayPeerConnection>,
        enable_webrtc: bool,
        webrtc_config: WebRtcConfig,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            relay: relay.clone(),
            enable_webrtc,
            webrtc_config,
            webrtc: StdMutex::new(None),
            upgrade_state: StdMutex::new(UpgradeState::NotUpgraded),
            upgrade_in_flight: AtomicBool::new(false),
            reject_reason: StdMutex::new(None),
            signaling_stream: StdMutex::new(None),
            dispatcher: Arc::new(StreamDispatcher::new()),
            relay_subs: StdMutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&this);
        let stream_sub = relay.on_stream(move |stream| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move {
                    this.route_incoming(stream, PathKind::Relay).await;
                });
            }
        });

        let weak = Arc::downgrade(&this);
        let state_sub = relay.on_state_change(move |state| {
            if !state.is_live() {
                if let Some(this) = weak.upgrade() {
                    this.on_relay_down();
                }
            }
        });

        this.relay_subs
            .lock()
            .expect("subs lock")
            .extend([stream_sub, state_sub]);
        this
    }

    pub fn peer_id(&self) -> NodeId {
        self.relay.peer_id()
    }

    /// Relay liveness is hybrid liveness.
    pub fn state(&self) -> ConnectionState {
        self.relay.state()
    }

    pub fn upgrade_state(&self) -> UpgradeState {
        *self.upgrade_state.lock().expect("upgrade lock")
    }

    /// Reason the peer rejected the upgrade, if it did.
    pub fn reject_reason(&self) -> Option<String> {
        self.reject_reason.lock().expect("reject lock").clone()
    }

    pub fn relay(&self) -> &Arc<RelayPeerConnection> {
        &self.relay
    }

    fn webrtc_if_connected(&self) -> Option<Arc<WebRtcPeerConnection>> {
        if self.upgrade_state() != UpgradeState::Upgraded {
            return None;
        }
        self.webrtc
            .lock()
            .expect("webrtc lock")
            .clone()
            .filter(|pc| pc.is_connected())
    }

    pub fn rtt_ms(&self) -> Option<u32> {
        match self.webrtc_if_connected() {
            Some(pc) => pc.rtt_ms(),
            None => self.relay.rtt_ms(),
        }
    }

    /// Whether the upgraded path is a true LAN-direct candidate pair.
    pub fn is_direct_connection(&self) -> bool {
        self.webrtc_if_connected()
            .map(|pc| pc.metrics().is_direct)
            .unwrap_or(false)
    }

    /// Human-readable path description for diagnostics.
    pub fn connection_type(&self) -> String {
        match self.webrtc_if_connected() {
            Some(pc) => {
                if pc.metrics().is_direct {
                    "WebRTC (direct)".to_string()
                } else {
                    "WebRTC (relay ICE)".to_string()
                }
            }
            None => "Iroh (relay)".to_string(),
        }
    }

    /// Open a stream on the best available path. Falls back to the relay,
    /// demoting first, when the upgraded path refuses.
    pub async fn open_stream(&self) -> Result<Arc<dyn PeerStream>> {
        if let Some(pc) = self.webrtc_if_connected() {
            match pc.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(error = %e, "WebRTC stream open failed, falling back to relay");
                    self.demote("stream open failure");
                }
            }
        }
        self.relay.open_stream().await
    }

    /// Accept the next incoming sync stream from either path.
    pub async fn accept_stream(&self) -> Result<Arc<dyn PeerStream>> {
        self.dispatcher.accept().await
    }

    /// Persistent subscriber for incoming sync streams from either path
    /// (single-owner policy).
    pub fn on_stream<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Arc<dyn PeerStream>) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(handler)
    }

    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.relay.on_state_change(handler)
    }

    pub async fn close(&self) {
        self.relay.close().await;
        // Relay teardown cascades through on_relay_down; make sure the
        // WebRTC half dies even if the state callback was already cleared.
        let webrtc = self.webrtc.lock().expect("webrtc lock").take();
        if let Some(pc) = webrtc {
            pc.close().await;
        }
    }

    /// Attempt the WebRTC upgrade as initiator.
    ///
    /// Returns `Ok(false)` without touching the connection when WebRTC is
    /// disabled or unavailable, an attempt is already in flight, the
    /// connection is already upgraded, or a previous reject made upgrading
    /// terminal. Errors never disconnect the relay.
    pub async fn attempt_upgrade(self: &Arc<Self>) -> Result<bool> {
        if !self.enable_webrtc || !webrtc_available() {
            return Ok(false);
        }
        if self.upgrade_state() == UpgradeState::Upgraded {
            return Ok(false);
        }
        if self.reject_reason().is_some() {
            debug!("upgrade previously rejected, not retrying");
            return Ok(false);
        }
        if self
            .upgrade_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("upgrade already in progress");
            return Ok(false);
        }

        self.set_upgrade_state(UpgradeState::Signaling);
        match self.run_initiator().await {
            Ok(()) => {
                self.promote();
                Ok(true)
            }
            Err(e) => {
                if let TransportError::UpgradeRejected { reason, .. } = &e {
                    *self.reject_reason.lock().expect("reject lock") = Some(reason.clone());
                }
                self.demote("upgrade attempt failed");
                Err(e)
            }
        }
    }

    // ---- state machine plumbing -------------------------------------------

    fn set_upgrade_state(&self, next: UpgradeState) {
        *self.upgrade_state.lock().expect("upgrade lock") = next;
    }

    fn promote(self: &Arc<Self>) {
        self.set_upgrade_state(UpgradeState::Upgraded);
        self.upgrade_in_flight.store(false, Ordering::SeqCst);
        info!(peer = %self.peer_id().fingerprint(), path = %self.connection_type(), "connection upgraded");

        // Watch the direct path; if it dies, fall back to the relay.
        if let Some(pc) = self.webrtc.lock().expect("webrtc lock").clone() {
            let weak = Arc::downgrade(self);
            let mut state_rx = pc.state_watch();
            tokio::spawn(async move {
                loop {
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                    let state = *state_rx.borrow();
                    if !state.is_live() {
                        if let Some(this) = weak.upgrade() {
                            if this.upgrade_state() == UpgradeState::Upgraded {
                                warn!("WebRTC path lost, continuing on relay");
                                this.demote("webrtc path lost");
                            }
                        }
                        return;
                    }
                }
            });
        }
    }

    /// Back to `NotUpgraded`; tear down the WebRTC half if present. The
    /// relay connection and the signaling stream are left untouched.
    fn demote(&self, why: &str) {
        debug!(why, "returning to relay-only");
        self.set_upgrade_state(UpgradeState::NotUpgraded);
        self.upgrade_in_flight.store(false, Ordering::SeqCst);
        if let Some(pc) = self.webrtc.lock().expect("webrtc lock").take() {
            tokio::spawn(async move {
                pc.close().await;
            });
        }
    }

    /// Relay loss disconnects the hybrid outright.
    fn on_relay_down(&self) {
        info!(peer = %self.peer_id().fingerprint(), "relay path down, hybrid disconnected");
        self.set_upgrade_state(UpgradeState::NotUpgraded);
        self.upgrade_in_flight.store(false, Ordering::SeqCst);

        if let Some(pc) = self.webrtc.lock().expect("webrtc lock").take() {
            tokio::spawn(async move {
                pc.close().await;
            });
        }
        if let Some(stream) = self.signaling_stream.lock().expect("signaling lock").take() {
            tokio::spawn(async move {
                let _ = stream.close().await;
            });
        }
        let backlog = self.dispatcher.shut_down(TransportError::ConnectionLost {
            peer: self.peer_id(),
        });
        for stream in backlog {
            tokio::spawn(async move {
                let _ = stream.close().await;
            });
        }
    }

    // ---- incoming stream routing ------------------------------------------

    async fn route_incoming(self: Arc<Self>, stream: Arc<dyn PeerStream>, path: PathKind) {
        let (class, stream) = match peek_and_classify(stream).await {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "incoming stream died before classification");
                return;
            }
        };

        match (class, path) {
            (StreamClass::Sync, _) => self.dispatcher.dispatch(stream),
            (StreamClass::Signaling, PathKind::Relay) => self.run_acceptor(stream).await,
            (StreamClass::Signaling, PathKind::WebRtc) => {
                warn!("signaling stream on the WebRTC path, closing");
                let _ = stream.close().await;
            }
        }
    }

    fn wire_webrtc_streams(self: &Arc<Self>, pc: &Arc<WebRtcPeerConnection>) {
        let weak = Arc::downgrade(self);
        pc.on_stream(move |stream| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move {
                    this.route_incoming(stream, PathKind::WebRtc).await;
                });
            }
        })
        .detach();
    }

    // ---- signaling drivers -------------------------------------------------

    async fn send_signaling(stream: &Arc<dyn PeerStream>, body: SignalingBody) -> Result<()> {
        let kind = body.kind_name();
        debug!(kind, "sending signaling message");
        stream.send(&encode(&SignalingMessage::now(body))).await
    }

    async fn recv_signaling(stream: &Arc<dyn PeerStream>) -> Result<SignalingMessage> {
        let bytes = stream.receive().await?;
        decode(&bytes)
    }

    /// Initiator: open the signaling stream and drive steps 1-5.
    async fn run_initiator(self: &Arc<Self>) -> Result<()> {
        let stream = self.relay.open_stream().await?;
        let duplicate = {
            let mut slot = self.signaling_stream.lock().expect("signaling lock");
            if slot.is_some() {
                true
            } else {
                *slot = Some(stream.clone());
                false
            }
        };
        if duplicate {
            let _ = stream.close().await;
            return Err(TransportError::SignalingFailed(
                "signaling stream already active".into(),
            ));
        }

        Self::send_signaling(&stream, SignalingBody::UpgradeRequest).await?;
        let reply = timeout(
            self.webrtc_config.signaling_timeout,
            Self::recv_signaling(&stream),
        )
        .await
        .map_err(|_| TransportError::UpgradeTimeout)??;

        match reply.body {
            SignalingBody::UpgradeAccept => {}
            SignalingBody::UpgradeReject { reason } => {
                info!(reason = %reason, "peer rejected upgrade");
                return Err(TransportError::UpgradeRejected {
                    peer: self.peer_id(),
                    reason,
                });
            }
            other => {
                return Err(TransportError::SignalingFailed(format!(
                    "expected accept/reject, got {}",
                    other.kind_name()
                )))
            }
        }

        let pc = WebRtcPeerConnection::new(self.peer_id(), self.webrtc_config.clone()).await?;
        self.wire_webrtc_streams(&pc);
        let cand_rx = pc.take_local_candidates();
        *self.webrtc.lock().expect("webrtc lock") = Some(pc.clone());

        let sdp = pc.create_offer().await?;
        Self::send_signaling(&stream, SignalingBody::Offer { sdp }).await?;

        // Candidates gathered before the answer arrives queue in the feed;
        // the drive loop forwards them.
        let reply = timeout(
            self.webrtc_config.signaling_timeout,
            Self::recv_signaling(&stream),
        )
        .await
        .map_err(|_| TransportError::UpgradeTimeout)??;
        let answer_sdp = match reply.body {
            SignalingBody::Answer { sdp } => sdp,
            SignalingBody::UpgradeReject { reason } => {
                return Err(TransportError::UpgradeRejected {
                    peer: self.peer_id(),
                    reason,
                })
            }
            other => {
                return Err(TransportError::SignalingFailed(format!(
                    "expected answer, got {}",
                    other.kind_name()
                )))
            }
        };
        pc.set_remote_answer(&answer_sdp).await?;

        self.drive_to_connected(&stream, &pc, cand_rx).await
    }

    /// Acceptor: an incoming signaling stream was classified; answer the
    /// request and drive the handshake to completion.
    async fn run_acceptor(self: &Arc<Self>, stream: Arc<dyn PeerStream>) {
        // Single signaling stream per connection: close duplicates.
        let duplicate = {
            let mut slot = self.signaling_stream.lock().expect("signaling lock");
            if slot.is_some() {
                true
            } else {
                *slot = Some(stream.clone());
                false
            }
        };
        if duplicate {
            warn!("duplicate signaling stream from peer, closing it");
            let _ = stream.close().await;
            return;
        }

        if let Err(e) = self.run_acceptor_inner(&stream).await {
            warn!(error = %e, "upgrade (acceptor side) failed");
            self.demote("acceptor handshake failed");
        }
    }

    async fn run_acceptor_inner(self: &Arc<Self>, stream: &Arc<dyn PeerStream>) -> Result<()> {
        let first = timeout(
            self.webrtc_config.signaling_timeout,
            Self::recv_signaling(stream),
        )
        .await
        .map_err(|_| TransportError::UpgradeTimeout)??;
        if first.body != SignalingBody::UpgradeRequest {
            return Err(TransportError::SignalingFailed(format!(
                "expected upgrade request, got {}",
                first.body.kind_name()
            )));
        }

        // Acceptance conditions: WebRTC available and enabled, and no
        // attempt already in flight for this peer.
        let reject = if !self.enable_webrtc || !webrtc_available() {
            Some("WebRTC not available")
        } else if self.upgrade_state() == UpgradeState::Upgraded {
            Some("already upgraded")
        } else if self
            .upgrade_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            Some("upgrade already in progress")
        } else {
            None
        };

        if let Some(reason) = reject {
            info!(reason, "rejecting upgrade request");
            Self::send_signaling(
                stream,
                SignalingBody::UpgradeReject {
                    reason: reason.to_string(),
                },
            )
            .await?;
            return Ok(());
        }

        self.set_upgrade_state(UpgradeState::Signaling);
        Self::send_signaling(stream, SignalingBody::UpgradeAccept).await?;

        let pc = WebRtcPeerConnection::new(self.peer_id(), self.webrtc_config.clone()).await?;
        self.wire_webrtc_streams(&pc);
        let cand_rx = pc.take_local_candidates();
        *self.webrtc.lock().expect("webrtc lock") = Some(pc.clone());

        let offer = timeout(
            self.webrtc_config.signaling_timeout,
            Self::recv_signaling(stream),
        )
        .await
        .map_err(|_| TransportError::UpgradeTimeout)??;
        let offer_sdp = match offer.body {
            SignalingBody::Offer { sdp } => sdp,
            other => {
                return Err(TransportError::SignalingFailed(format!(
                    "expected offer, got {}",
                    other.kind_name()
                )))
            }
        };

        pc.set_remote_offer(&offer_sdp).await?;
        let answer = pc.create_answer().await?;
        Self::send_signaling(stream, SignalingBody::Answer { sdp: answer }).await?;

        self.drive_to_connected(stream, &pc, cand_rx).await?;
        self.promote();
        Ok(())
    }

    /// Step 4-5: trickle candidates both ways, exchange `Ready`, and wait
    /// for the local peer to reach `connected`. Bounded by
    /// `connection_timeout`.
    async fn drive_to_connected(
        &self,
        stream: &Arc<dyn PeerStream>,
        pc: &Arc<WebRtcPeerConnection>,
        cand_rx: Option<mpsc::UnboundedReceiver<RTCIceCandidateInit>>,
    ) -> Result<()> {
        let mut cand_rx = cand_rx;
        let mut state_rx = pc.state_watch();
        let mut local_ready = false;
        let mut peer_ready = false;
        let mut ready_sent = false;
        let deadline = Instant::now() + self.webrtc_config.connection_timeout;

        loop {
            if !local_ready && state_rx.borrow().is_live() {
                local_ready = true;
            }
            if local_ready && !ready_sent {
                Self::send_signaling(stream, SignalingBody::Ready).await?;
                ready_sent = true;
            }
            if ready_sent && peer_ready {
                return Ok(());
            }

            tokio::select! {
                candidate = recv_or_pending(&mut cand_rx) => {
                    match candidate {
                        Some(init) => {
                            Self::send_signaling(stream, SignalingBody::IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index.map(i32::from),
                            })
                            .await?;
                        }
                        // Gathering complete; stop polling the feed.
                        None => cand_rx = None,
                    }
                }
                msg = Self::recv_signaling(stream) => {
                    let msg = msg?;
                    match msg.body {
                        SignalingBody::IceCandidate { candidate, sdp_mid, sdp_mline_index } => {
                            let init = RTCIceCandidateInit {
                                candidate,
                                sdp_mid,
                                sdp_mline_index: sdp_mline_index
                                    .and_then(|i| u16::try_from(i).ok()),
                                ..Default::default()
                            };
                            pc.add_ice_candidate(init).await?;
                        }
                        SignalingBody::Ready => peer_ready = true,
                        other => {
                            return Err(TransportError::SignalingFailed(format!(
                                "unexpected {} during establishment",
                                other.kind_name()
                            )));
                        }
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::DataChannelError(
                            "peer connection dropped".into(),
                        ));
                    }
                    let state = *state_rx.borrow();
                    if matches!(state, ConnectionState::Error | ConnectionState::Disconnected) {
                        return Err(TransportError::DataChannelError(
                            "WebRTC connection failed during establishment".into(),
                        ));
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(TransportError::UpgradeTimeout);
                }
            }
        }
    }
}

/// Poll the candidate feed if it still exists, else park forever so the
/// select arm goes quiet.
async fn recv_or_pending(
    rx: &mut Option<mpsc::UnboundedReceiver<RTCIceCandidateInit>>,
) -> Option<RTCIceCandidateInit> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
