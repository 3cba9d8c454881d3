//! Stream demultiplexer
//!
//! Every incoming stream is classified by peeking its first whole framed
//! message: a `"PVWS"` magic prefix plus a type byte in `0x30..=0x36` marks
//! a signaling stream; any other first byte marks a sync stream. The peeked
//! message is not lost: the stream is rewrapped so its first `receive()`
//! replays the peeked bytes verbatim and later calls delegate.
//!
//! Classification is deterministic on the first message, with no timing
//! dependency: a type-byte check alone would be ambiguous if a sync protocol
//! ever used a byte in the reserved range, so the 4-byte magic is the
//! committed identifier.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use peervault_core::Result;
use peervault_signaling::is_signaling_frame;

use crate::stream::PeerStream;

/// What the first framed message says the stream is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Carries only signaling messages; routed to the upgrade driver.
    Signaling,
    /// Opaque payload; surfaced to the host application.
    Sync,
}

/// Read the first whole message, classify, and rewrap so no bytes are lost.
pub async fn peek_and_classify(
    stream: Arc<dyn PeerStream>,
) -> Result<(StreamClass, Arc<dyn PeerStream>)> {
    let first = stream.receive().await?;
    let class = if is_signaling_frame(&first) {
        StreamClass::Signaling
    } else {
        StreamClass::Sync
    };
    let replay: Arc<dyn PeerStream> = Arc::new(ReplayStream {
        inner: stream,
        replay: StdMutex::new(Some(first)),
    });
    Ok((class, replay))
}

/// Hands back the peeked first message, then delegates everything.
struct ReplayStream {
    inner: Arc<dyn PeerStream>,
    replay: StdMutex<Option<Vec<u8>>>,
}

#[async_trait]
impl PeerStream for ReplayStream {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.send(data).await
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        let replayed = self.replay.lock().expect("replay lock").take();
        match replayed {
            Some(first) => Ok(first),
            None => self.inner.receive().await,
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervault_core::TransportError;
    use peervault_signaling::{encode, SignalingBody, SignalingMessage};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct FeedStream {
        incoming: Mutex<VecDeque<Vec<u8>>>,
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl FeedStream {
        fn with(messages: Vec<Vec<u8>>) -> Arc<dyn PeerStream> {
            Arc::new(Self {
                incoming: Mutex::new(messages.into()),
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PeerStream for FeedStream {
        fn id(&self) -> &str {
            "feed-in-1"
        }

        async fn send(&self, data: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn receive(&self) -> Result<Vec<u8>> {
            self.incoming.lock().await.pop_front().ok_or_else(|| {
                TransportError::StreamClosed {
                    stream_id: "feed-in-1".into(),
                }
            })
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn signaling_first_message_classifies_signaling() {
        let frame = encode(&SignalingMessage::new(0, SignalingBody::UpgradeRequest));
        let stream = FeedStream::with(vec![frame.clone()]);

        let (class, replay) = peek_and_classify(stream).await.unwrap();
        assert_eq!(class, StreamClass::Signaling);
        // Replay preservation: first receive returns the peeked bytes.
        assert_eq!(replay.receive().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn sync_first_message_classifies_sync() {
        // A sync VERSION_INFO-style first byte.
        let first = vec![0x01, 0x00, 0x02];
        let stream = FeedStream::with(vec![first.clone(), vec![0xFF]]);

        let (class, replay) = peek_and_classify(stream).await.unwrap();
        assert_eq!(class, StreamClass::Sync);
        assert_eq!(replay.receive().await.unwrap(), first);
        // Subsequent receives delegate to the underlying stream.
        assert_eq!(replay.receive().await.unwrap(), vec![0xFF]);
    }

    #[tokio::test]
    async fn type_byte_without_magic_is_sync() {
        // First byte in the reserved type range, but no PVWS magic.
        let first = vec![0x30, 0x31, 0x32, 0x33, 0x34];
        let (class, _) = peek_and_classify(FeedStream::with(vec![first]))
            .await
            .unwrap();
        assert_eq!(class, StreamClass::Sync);
    }

    #[tokio::test]
    async fn magic_with_out_of_range_type_is_sync() {
        let mut first = b"PVWS".to_vec();
        first.push(0x40);
        first.extend_from_slice(&[0; 8]);
        let (class, _) = peek_and_classify(FeedStream::with(vec![first]))
            .await
            .unwrap();
        assert_eq!(class, StreamClass::Sync);
    }

    #[tokio::test]
    async fn replay_wrapper_delegates_send() {
        let frame = encode(&SignalingMessage::new(0, SignalingBody::Ready));
        let stream = FeedStream::with(vec![frame]);
        let (_, replay) = peek_and_classify(stream).await.unwrap();
        replay.send(b"pass-through").await.unwrap();
        assert!(replay.is_open());
    }
}
