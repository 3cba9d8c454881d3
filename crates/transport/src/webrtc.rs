//! WebRTC peer connection
//!
//! Wraps an `RTCPeerConnection` behind the same peer-connection surface as
//! the relay path: DataChannel-backed streams with length-prefix framing,
//! the shared incoming-stream dispatch discipline, ICE candidates queued
//! until the remote description lands, and metrics polled from the stats
//! report on first `connected`.
//!
//! The signaling helpers here are driven by the hybrid connection's upgrade
//! state machine, never by the peer directly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use peervault_core::{ConnectionState, NodeId, Result, TransportError};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::candidate::CandidateType;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config::WebRtcConfig;
use crate::dispatch::StreamDispatcher;
use crate::framing::{ByteChannel, FramedStream};
use crate::stream::PeerStream;
use crate::subscription::Subscription;

/// Label of the throw-away channel that forces SCTP negotiation into the
/// initial SDP offer. Never carries data.
const BOOTSTRAP_CHANNEL_LABEL: &str = "peervault-main";
/// Sub-protocol advertised on every stream data channel.
const STREAM_PROTOCOL: &str = "peervault-sync";

/// Candidate classification from the selected ICE pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateKind {
    fn from_stats(candidate_type: CandidateType) -> Option<Self> {
        match candidate_type {
            CandidateType::Host => Some(Self::Host),
            CandidateType::ServerReflexive => Some(Self::Srflx),
            CandidateType::PeerReflexive => Some(Self::Prflx),
            CandidateType::Relay => Some(Self::Relay),
            CandidateType::Unspecified => None,
        }
    }
}

/// Connection metrics captured when the peer first reaches `connected`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcMetrics {
    pub rtt_ms: Option<u32>,
    pub local_candidate_type: Option<CandidateKind>,
    pub remote_candidate_type: Option<CandidateKind>,
    /// Both ends selected host candidates: true LAN-direct path.
    pub is_direct: bool,
}

/// Synchronous feature probe: whether a WebRTC stack can be constructed in
/// this build. Cached after the first call.
pub fn webrtc_available() -> bool {
    static AVAILABLE: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let _ = APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .build();
        true
    })
}

/// The direct-path peer connection.
pub struct WebRtcPeerConnection {
    peer_id: NodeId,
    pc: Arc<RTCPeerConnection>,
    config: WebRtcConfig,
    state_tx: watch::Sender<ConnectionState>,
    dispatcher: Arc<StreamDispatcher>,
    /// ICE candidates received before the remote description was applied.
    pending_candidates: StdMutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    out_counter: AtomicU64,
    in_counter: Arc<AtomicU64>,
    metrics: Arc<StdMutex<WebRtcMetrics>>,
    closed_by_us: Arc<AtomicBool>,
    local_candidates: StdMutex<Option<mpsc::UnboundedReceiver<RTCIceCandidateInit>>>,
}

impl WebRtcPeerConnection {
    pub async fn new(peer_id: NodeId, config: WebRtcConfig) -> Result<Arc<Self>> {
        let api = APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| TransportError::DataChannelError(e.to_string()))?;

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (cand_tx, cand_rx) = mpsc::unbounded_channel();

        let this = Arc::new(Self {
            peer_id,
            pc: Arc::new(pc),
            config,
            state_tx,
            dispatcher: Arc::new(StreamDispatcher::new()),
            pending_candidates: StdMutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            out_counter: AtomicU64::new(0),
            in_counter: Arc::new(AtomicU64::new(0)),
            metrics: Arc::new(StdMutex::new(WebRtcMetrics::default())),
            closed_by_us: Arc::new(AtomicBool::new(false)),
            local_candidates: StdMutex::new(Some(cand_rx)),
        });

        this.wire_handlers(cand_tx);
        Ok(this)
    }

    fn wire_handlers(self: &Arc<Self>, cand_tx: mpsc::UnboundedSender<RTCIceCandidateInit>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |raw_state| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.apply_raw_state(raw_state);
                    }
                })
            }));

        // Candidate gathering: forward each local candidate; the channel is
        // dropped on end-of-candidates so the consumer observes completion.
        let cand_tx = StdMutex::new(Some(cand_tx));
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        if let Some(tx) = cand_tx.lock().expect("candidate lock").as_ref() {
                            let _ = tx.send(init);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize local ICE candidate"),
                },
                None => {
                    debug!("ICE gathering complete");
                    cand_tx.lock().expect("candidate lock").take();
                }
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        self.pc.on_data_channel(Box::new(move |dc| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.adopt_incoming_channel(dc);
                }
            })
        }));
    }

    fn apply_raw_state(self: &Arc<Self>, raw: RTCPeerConnectionState) {
        let mapped = match raw {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                ConnectionState::Connecting
            }
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                if self.closed_by_us.load(Ordering::SeqCst) {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Error
                }
            }
            RTCPeerConnectionState::Unspecified => return,
        };

        // send_replace updates the value even with no receivers subscribed.
        let previous = self.state_tx.send_replace(mapped);
        let first_connected =
            mapped == ConnectionState::Connected && previous != ConnectionState::Connected;

        if first_connected {
            info!(peer = %self.peer_id.fingerprint(), "WebRTC peer connected");
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                if let Some(this) = weak.upgrade() {
                    this.capture_metrics().await;
                }
            });
        }
    }

    /// Pull the selected candidate pair out of the stats report.
    async fn capture_metrics(&self) {
        let report = self.pc.get_stats().await;

        let mut pair_rtt: Option<u32> = None;
        let mut local_id = None;
        let mut remote_id = None;
        for stat in report.reports.values() {
            if let StatsReportType::CandidatePair(pair) = stat {
                if pair.nominated {
                    if pair.current_round_trip_time > 0.0 {
                        pair_rtt = Some((pair.current_round_trip_time * 1000.0) as u32);
                    }
                    local_id = Some(pair.local_candidate_id.clone());
                    remote_id = Some(pair.remote_candidate_id.clone());
                    break;
                }
            }
        }

        let mut local_kind = None;
        let mut remote_kind = None;
        for stat in report.reports.values() {
            match stat {
                StatsReportType::LocalCandidate(c) if Some(&c.id) == local_id.as_ref() => {
                    local_kind = CandidateKind::from_stats(c.candidate_type);
                }
                StatsReportType::RemoteCandidate(c) if Some(&c.id) == remote_id.as_ref() => {
                    remote_kind = CandidateKind::from_stats(c.candidate_type);
                }
                _ => {}
            }
        }

        let metrics = WebRtcMetrics {
            rtt_ms: pair_rtt,
            local_candidate_type: local_kind,
            remote_candidate_type: remote_kind,
            is_direct: local_kind == Some(CandidateKind::Host)
                && remote_kind == Some(CandidateKind::Host),
        };
        debug!(peer = %self.peer_id.fingerprint(), ?metrics, "captured WebRTC metrics");
        *self.metrics.lock().expect("metrics lock") = metrics;
    }

    pub fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_live()
    }

    pub fn metrics(&self) -> WebRtcMetrics {
        *self.metrics.lock().expect("metrics lock")
    }

    pub fn rtt_ms(&self) -> Option<u32> {
        self.metrics().rtt_ms
    }

    pub fn pending_stream_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Take the local candidate feed. Yields every gathered candidate, then
    /// ends when gathering completes. Single consumer: the upgrade driver.
    pub fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<RTCIceCandidateInit>> {
        self.local_candidates
            .lock()
            .expect("candidate feed lock")
            .take()
    }

    /// Create the SDP offer. Opens the throw-away bootstrap channel first so
    /// the offer carries an SCTP section.
    pub async fn create_offer(&self) -> Result<String> {
        self.pc
            .create_data_channel(BOOTSTRAP_CHANNEL_LABEL, None)
            .await
            .map_err(|e| TransportError::DataChannelError(e.to_string()))?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("create_offer: {e}")))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("set_local_description: {e}")))?;
        Ok(sdp)
    }

    pub async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("create_answer: {e}")))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("set_local_description: {e}")))?;
        Ok(sdp)
    }

    pub async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let desc = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| TransportError::SignalingFailed(format!("parse offer: {e}")))?;
        self.apply_remote_description(desc).await
    }

    pub async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let desc = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| TransportError::SignalingFailed(format!("parse answer: {e}")))?;
        self.apply_remote_description(desc).await
    }

    async fn apply_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("set_remote_description: {e}")))?;
        self.remote_description_set.store(true, Ordering::SeqCst);

        // Flush candidates that arrived early, in arrival order.
        let queued: Vec<RTCIceCandidateInit> = {
            let mut pending = self.pending_candidates.lock().expect("pending lock");
            pending.drain(..).collect()
        };
        for init in queued {
            self.pc
                .add_ice_candidate(init)
                .await
                .map_err(|e| TransportError::SignalingFailed(format!("add_ice_candidate: {e}")))?;
        }
        Ok(())
    }

    /// Apply a remote candidate now, or queue it until the remote
    /// description is set.
    pub async fn add_ice_candidate(&self, init: RTCIceCandidateInit) -> Result<()> {
        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates
                .lock()
                .expect("pending lock")
                .push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("add_ice_candidate: {e}")))
    }

    /// Open a new stream: an ordered reliable data channel wrapped in
    /// length-prefix framing. Waits for channel open, bounded by
    /// `connection_timeout`.
    pub async fn open_stream(&self) -> Result<Arc<dyn PeerStream>> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed { peer: self.peer_id });
        }

        let n = self.out_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let label = format!("stream-{n}");
        let init = RTCDataChannelInit {
            ordered: Some(true),
            protocol: Some(STREAM_PROTOCOL.to_string()),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&label, Some(init))
            .await
            .map_err(|e| TransportError::DataChannelError(e.to_string()))?;

        let (channel, opened) = DataChannelByteChannel::wire(dc);
        tokio::time::timeout(self.config.connection_timeout, opened)
            .await
            .map_err(|_| TransportError::UpgradeTimeout)?
            .map_err(|_| TransportError::DataChannelError("channel closed before open".into()))?;

        let id = format!("{}-out-{}", self.peer_id, n);
        let stream: Arc<dyn PeerStream> =
            FramedStream::new(id, channel, self.config.max_buffered_amount);
        Ok(stream)
    }

    pub async fn accept_stream(&self) -> Result<Arc<dyn PeerStream>> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed { peer: self.peer_id });
        }
        self.dispatcher.accept().await
    }

    /// Persistent incoming-stream subscriber; same single-owner policy as
    /// the relay path.
    pub fn on_stream<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Arc<dyn PeerStream>) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(handler)
    }

    fn adopt_incoming_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        if dc.label() == BOOTSTRAP_CHANNEL_LABEL {
            debug!("ignoring bootstrap data channel");
            return;
        }

        let n = self.in_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-in-{}", self.peer_id, n);
        debug!(stream = %id, label = dc.label(), "incoming data channel");

        let (channel, opened) = DataChannelByteChannel::wire(dc);
        let stream: Arc<dyn PeerStream> =
            FramedStream::new(id, channel, self.config.max_buffered_amount);

        // Dispatch only once the channel is actually open.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if opened.await.is_ok() {
                if let Some(this) = weak.upgrade() {
                    this.dispatcher.dispatch(stream);
                }
            }
        });
    }

    /// Tear down the peer connection. Idempotent.
    pub async fn close(&self) {
        if self.closed_by_us.swap(true, Ordering::SeqCst) {
            return;
        }
        let backlog = self.dispatcher.shut_down(TransportError::ConnectionClosed {
            peer: self.peer_id,
        });
        for stream in backlog {
            let _ = stream.close().await;
        }
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "error closing WebRTC peer connection");
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// [`ByteChannel`] over one RTCDataChannel.
struct DataChannelByteChannel {
    dc: Arc<RTCDataChannel>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    open: Arc<AtomicBool>,
}

impl DataChannelByteChannel {
    /// Attach message/open/close handlers. Returns the channel and a signal
    /// that fires once the channel is open.
    fn wire(dc: Arc<RTCDataChannel>) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(false));

        let msg_tx = Arc::new(StdMutex::new(Some(msg_tx)));
        let on_message_tx = msg_tx.clone();
        dc.on_message(Box::new(move |msg| {
            if let Some(tx) = on_message_tx.lock().expect("message lock").as_ref() {
                let _ = tx.send(msg.data.to_vec());
            }
            Box::pin(async {})
        }));

        let open_tx = StdMutex::new(Some(open_tx));
        let open_flag = open.clone();
        dc.on_open(Box::new(move || {
            open_flag.store(true, Ordering::SeqCst);
            if let Some(tx) = open_tx.lock().expect("open lock").take() {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));

        let open_flag = open.clone();
        dc.on_close(Box::new(move || {
            open_flag.store(false, Ordering::SeqCst);
            // Dropping the sender ends the inbound feed for the reader.
            msg_tx.lock().expect("message lock").take();
            Box::pin(async {})
        }));

        (
            Arc::new(Self {
                dc,
                inbound: Mutex::new(msg_rx),
                open,
            }),
            open_rx,
        )
    }
}

#[async_trait::async_trait]
impl ByteChannel for DataChannelByteChannel {
    async fn send_chunk(&self, data: &[u8]) -> Result<()> {
        self.dc
            .send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::DataChannelError(e.to_string()))
    }

    async fn recv_chunk(&self) -> Result<Vec<u8>> {
        self.inbound.lock().await.recv().await.ok_or_else(|| {
            TransportError::StreamClosed {
                stream_id: self.dc.label().to_string(),
            }
        })
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close_channel(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.dc
            .close()
            .await
            .map_err(|e| TransportError::DataChannelError(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_probe_is_stable() {
        assert!(webrtc_available());
        assert!(webrtc_available());
    }

    #[tokio::test]
    async fn new_peer_starts_connecting() {
        let peer = NodeId::from_bytes([7; 32]);
        let pc = WebRtcPeerConnection::new(peer, WebRtcConfig::default())
            .await
            .unwrap();
        assert_eq!(pc.state(), ConnectionState::Connecting);
        assert!(!pc.is_connected());
        assert!(pc.take_local_candidates().is_some());
        // The feed is taken exactly once.
        assert!(pc.take_local_candidates().is_none());
        pc.close().await;
    }

    #[tokio::test]
    async fn open_stream_requires_connected() {
        let peer = NodeId::from_bytes([8; 32]);
        let pc = WebRtcPeerConnection::new(peer, WebRtcConfig::default())
            .await
            .unwrap();
        let err = pc.open_stream().await.unwrap_err();
        assert_eq!(err, TransportError::ConnectionClosed { peer });
        pc.close().await;
    }

    #[tokio::test]
    async fn early_candidates_queue_until_remote_description() {
        let peer = NodeId::from_bytes([9; 32]);
        let pc = WebRtcPeerConnection::new(peer, WebRtcConfig::default())
            .await
            .unwrap();

        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 5000 typ host".to_string(),
            ..Default::default()
        };
        // No remote description yet: queued, not applied.
        pc.add_ice_candidate(init).await.unwrap();
        assert_eq!(pc.pending_candidates.lock().unwrap().len(), 1);
        pc.close().await;
    }
}
