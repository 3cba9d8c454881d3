//! Stream handles surfaced by the transport
//!
//! Every stream the transport hands out implements [`PeerStream`], whatever
//! the underlying path: a relay stream, a framed WebRTC data channel, or the
//! demultiplexer's replay wrapper. Handles are `Arc`-shared so the owning
//! connection can force-close live streams while callers still hold them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use peervault_core::{RelayStream, Result, TransportError};
use tokio::sync::Mutex;

/// A bidirectional ordered byte channel nested inside a connection.
///
/// `receive` yields one whole message; delivery is FIFO and byte-exact.
#[async_trait]
pub trait PeerStream: Send + Sync {
    /// Human-readable id: `"{peer}-{in|out}-{n}"`.
    fn id(&self) -> &str;

    async fn send(&self, data: &[u8]) -> Result<()>;

    async fn receive(&self) -> Result<Vec<u8>>;

    /// Idempotent close. Subsequent sends fail `StreamClosed`; receives fail
    /// with the close reason if one was recorded.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

impl std::fmt::Debug for dyn PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream").field("id", &self.id()).finish()
    }
}

/// Closed-state shared between a stream handle and its owning connection.
pub(crate) struct StreamShared {
    closed: AtomicBool,
    reason: StdMutex<Option<TransportError>>,
}

impl StreamShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            reason: StdMutex::new(None),
        })
    }

    /// Mark closed; the first recorded reason wins. Returns whether this call
    /// performed the close.
    pub(crate) fn close_with(&self, reason: Option<TransportError>) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            *self.reason.lock().expect("reason lock") = reason;
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_error(&self, stream_id: &str) -> TransportError {
        self.reason
            .lock()
            .expect("reason lock")
            .clone()
            .unwrap_or_else(|| TransportError::StreamClosed {
                stream_id: stream_id.to_string(),
            })
    }
}

/// [`PeerStream`] over a message-granular relay stream.
pub struct RelayBackedStream {
    id: String,
    inner: Mutex<Box<dyn RelayStream>>,
    shared: Arc<StreamShared>,
}

impl RelayBackedStream {
    pub(crate) fn new(id: String, inner: Box<dyn RelayStream>) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(inner),
            shared: StreamShared::new(),
        })
    }

    pub(crate) fn shared(&self) -> Arc<StreamShared> {
        self.shared.clone()
    }
}

#[async_trait]
impl PeerStream for RelayBackedStream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.shared.is_closed() {
            return Err(TransportError::StreamClosed {
                stream_id: self.id.clone(),
            });
        }
        self.inner.lock().await.send(data).await
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        if self.shared.is_closed() {
            return Err(self.shared.close_error(&self.id));
        }
        match self.inner.lock().await.receive().await {
            Ok(data) => Ok(data),
            Err(e) => {
                // The underlying stream died; latch the reason for later calls.
                self.shared.close_with(Some(e.clone()));
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shared.close_with(None) {
            self.inner.lock().await.close().await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }
}
