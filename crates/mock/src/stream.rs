//! Linked mock stream pairs
//!
//! A pair is two halves joined by channels: sends on one half surface as
//! receives on the other. Each half holds only channel endpoints, never its
//! peer object, so there are no reference cycles. Knobs: per-message
//! latency and a fail-after-N-sends trigger for error-path tests.

use std::time::Duration;

use async_trait::async_trait;
use peervault_core::{RelayStream, Result, TransportError};
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Behavior knobs applied to every stream created under a registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockStreamConfig {
    /// Injected delay before each message is handed to the channel.
    pub latency: Duration,
    /// After this many successful sends, further sends fail.
    pub fail_after_messages: Option<u64>,
}

/// Create a linked pair with the given knobs on both halves.
pub fn linked_pair(config: MockStreamConfig) -> (MockRelayStream, MockRelayStream) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MockRelayStream::new(a_tx, a_rx, config),
        MockRelayStream::new(b_tx, b_rx, config),
    )
}

/// One half of a linked pair.
pub struct MockRelayStream {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    config: MockStreamConfig,
    sent: u64,
}

impl MockRelayStream {
    fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        config: MockStreamConfig,
    ) -> Self {
        Self {
            tx: Some(tx),
            rx,
            config,
            sent: 0,
        }
    }

    fn closed_error() -> TransportError {
        TransportError::StreamClosed {
            stream_id: "mock".into(),
        }
    }
}

#[async_trait]
impl RelayStream for MockRelayStream {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(Self::closed_error)?;

        if let Some(limit) = self.config.fail_after_messages {
            if self.sent >= limit {
                self.tx = None;
                return Err(Self::closed_error());
            }
        }

        if !self.config.latency.is_zero() {
            sleep(self.config.latency).await;
        }

        tx.send(data.to_vec()).map_err(|_| Self::closed_error())?;
        self.sent += 1;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or_else(Self::closed_error)
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the peer's receive feed.
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_surface_as_peer_receives_in_order() {
        let (mut a, mut b) = linked_pair(MockStreamConfig::default());

        a.send(&[1]).await.unwrap();
        a.send(&[2, 3]).await.unwrap();
        a.send(&[]).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), vec![1]);
        assert_eq!(b.receive().await.unwrap(), vec![2, 3]);
        assert_eq!(b.receive().await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn both_directions_are_independent() {
        let (mut a, mut b) = linked_pair(MockStreamConfig::default());
        a.send(b"ping").await.unwrap();
        b.send(b"pong").await.unwrap();
        assert_eq!(b.receive().await.unwrap(), b"ping");
        assert_eq!(a.receive().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn close_ends_peer_receive() {
        let (mut a, mut b) = linked_pair(MockStreamConfig::default());
        a.close().await.unwrap();
        let err = b.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::StreamClosed { .. }));
    }

    #[tokio::test]
    async fn fail_after_messages_trips_send() {
        let (mut a, mut b) = linked_pair(MockStreamConfig {
            latency: Duration::ZERO,
            fail_after_messages: Some(2),
        });

        a.send(&[1]).await.unwrap();
        a.send(&[2]).await.unwrap();
        let err = a.send(&[3]).await.unwrap_err();
        assert!(matches!(err, TransportError::StreamClosed { .. }));

        // Delivered messages are unaffected; then the feed ends.
        assert_eq!(b.receive().await.unwrap(), vec![1]);
        assert_eq!(b.receive().await.unwrap(), vec![2]);
        assert!(b.receive().await.is_err());
    }

    #[tokio::test]
    async fn latency_delays_delivery() {
        tokio::time::pause();
        let (mut a, mut b) = linked_pair(MockStreamConfig {
            latency: Duration::from_millis(50),
            fail_after_messages: None,
        });

        let send = tokio::spawn(async move {
            a.send(b"slow").await.unwrap();
            a
        });
        assert_eq!(b.receive().await.unwrap(), b"slow");
        let _ = send.await.unwrap();
    }
}
