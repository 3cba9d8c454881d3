//! Transport configuration

use std::sync::Arc;
use std::time::Duration;

use peervault_core::SecretStore;

/// Configuration for a transport instance.
///
/// The log sink is the `tracing` facade; `debug` selects the verbose filter
/// when the host calls [`crate::logging::init_from_config`].
#[derive(Clone)]
pub struct TransportConfig {
    /// Adapter for secret-key persistence.
    pub storage: Arc<dyn SecretStore>,
    /// Custom relay server URLs; empty means the relay implementation's
    /// defaults.
    pub relay_urls: Vec<String>,
    /// Enables verbose tracing.
    pub debug: bool,
    /// When set, the hybrid transport attempts WebRTC upgrades
    /// opportunistically on every new connection.
    pub enable_webrtc: bool,
    pub webrtc: WebRtcConfig,
}

impl TransportConfig {
    pub fn new(storage: Arc<dyn SecretStore>) -> Self {
        Self {
            storage,
            relay_urls: Vec::new(),
            debug: false,
            enable_webrtc: false,
            webrtc: WebRtcConfig::default(),
        }
    }
}

/// WebRTC upgrade tuning knobs.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE server URLs. Empty means LAN-only host candidates.
    pub ice_servers: Vec<String>,
    /// Bound on waiting for local ICE gathering to finish.
    pub ice_gathering_timeout: Duration,
    /// Bound on WebRTC connection establishment (offer sent to `connected`).
    pub connection_timeout: Duration,
    /// Bound on each signaling exchange (request/accept, SDP, ICE).
    pub signaling_timeout: Duration,
    /// Data-channel send buffer threshold before backpressure kicks in.
    pub max_buffered_amount: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_gathering_timeout: Duration::from_millis(5000),
            connection_timeout: Duration::from_millis(10000),
            signaling_timeout: Duration::from_millis(5000),
            max_buffered_amount: 1024 * 1024,
        }
    }
}
