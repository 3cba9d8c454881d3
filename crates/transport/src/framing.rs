//! Length-prefixed message framing over an unframed byte channel
//!
//! WebRTC data channels (and any other byte-granular transport) deliver
//! chunks with arbitrary boundaries. [`FramedStream`] restores message
//! granularity: every outgoing message is prefixed with a 4-byte big-endian
//! length, and receiving reassembles raw chunks until one whole message is
//! available. Partial frames persist across receive calls; a single receive
//! returns exactly one complete message or suspends.
//!
//! Sending applies backpressure against the channel's buffered-bytes
//! counter: when it exceeds the threshold the sender polls at 10 ms
//! intervals until it drains or 30 s elapse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use peervault_core::{Result, TransportError};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::stream::PeerStream;

/// Poll interval while the send buffer is above the threshold.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Give up on a full send buffer after this long.
pub const BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(30);
/// Frame header size: u32 big-endian payload length.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// An unframed reliable ordered byte channel.
///
/// `recv_chunk` yields raw bytes with arbitrary boundaries; `buffered_amount`
/// reports bytes queued locally but not yet handed to the network.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    async fn send_chunk(&self, data: &[u8]) -> Result<()>;

    async fn recv_chunk(&self) -> Result<Vec<u8>>;

    async fn buffered_amount(&self) -> usize;

    async fn close_channel(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// [`PeerStream`] imposing message framing on a [`ByteChannel`].
pub struct FramedStream {
    id: String,
    channel: Arc<dyn ByteChannel>,
    /// Raw bytes received but not yet assembled into a full frame.
    reassembly: Mutex<Vec<u8>>,
    max_buffered_amount: usize,
    closed: AtomicBool,
    close_reason: StdMutex<Option<TransportError>>,
}

impl FramedStream {
    pub fn new(id: String, channel: Arc<dyn ByteChannel>, max_buffered_amount: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            channel,
            reassembly: Mutex::new(Vec::new()),
            max_buffered_amount,
            closed: AtomicBool::new(false),
            close_reason: StdMutex::new(None),
        })
    }

    /// Mark the stream closed with a reason, without touching the channel.
    /// Used when the owning connection tears down.
    pub(crate) fn mark_closed(&self, reason: TransportError) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.close_reason.lock().expect("reason lock") = Some(reason);
        }
    }

    fn closed_error(&self) -> TransportError {
        self.close_reason
            .lock()
            .expect("reason lock")
            .clone()
            .unwrap_or_else(|| TransportError::StreamClosed {
                stream_id: self.id.clone(),
            })
    }

    /// Pop one complete frame off the reassembly buffer, if present.
    fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        if buffer.len() < LENGTH_PREFIX_LEN {
            return None;
        }
        let len = u32::from_be_bytes(buffer[..LENGTH_PREFIX_LEN].try_into().expect("4 bytes"))
            as usize;
        if buffer.len() < LENGTH_PREFIX_LEN + len {
            return None;
        }
        let frame = buffer[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len].to_vec();
        buffer.drain(..LENGTH_PREFIX_LEN + len);
        Some(frame)
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let deadline = Instant::now() + BACKPRESSURE_TIMEOUT;
        while self.channel.buffered_amount().await > self.max_buffered_amount {
            if Instant::now() >= deadline {
                return Err(TransportError::BackpressureTimeout {
                    stream_id: self.id.clone(),
                });
            }
            sleep(BACKPRESSURE_POLL_INTERVAL).await;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerStream for FramedStream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !self.channel.is_open() {
            return Err(TransportError::StreamClosed {
                stream_id: self.id.clone(),
            });
        }

        self.wait_for_capacity().await?;

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + data.len());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);
        self.channel.send_chunk(&frame).await
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        let mut buffer = self.reassembly.lock().await;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }
            if let Some(frame) = Self::take_frame(&mut buffer) {
                return Ok(frame);
            }
            match self.channel.recv_chunk().await {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    self.mark_closed(e.clone());
                    return Err(e);
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.close_channel().await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channel.is_open()
    }
}
