//! Property-based tests for the framed byte stream
//!
//! The framer must deliver exactly the sent sequence of messages whatever
//! chunk boundaries the underlying byte channel produces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use peervault_core::{Result, TransportError};
use peervault_transport::framing::{ByteChannel, FramedStream};
use peervault_transport::PeerStream;
use proptest::prelude::*;
use tokio::sync::{mpsc, Mutex};

/// Byte channel fed from a prepared chunk list.
struct ChunkedChannel {
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    open: AtomicBool,
}

fn chunked(chunks: Vec<Vec<u8>>) -> Arc<ChunkedChannel> {
    let (tx, rx) = mpsc::unbounded_channel();
    for chunk in chunks {
        tx.send(chunk).expect("feed chunk");
    }
    Arc::new(ChunkedChannel {
        rx: Mutex::new(rx),
        open: AtomicBool::new(true),
    })
}

#[async_trait]
impl ByteChannel for ChunkedChannel {
    async fn send_chunk(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn recv_chunk(&self) -> Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::StreamClosed {
                stream_id: "chunked".into(),
            })
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn close_channel(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Concatenate framed messages, then split the byte stream at arbitrary
/// points chosen by the strategy.
fn resplit(messages: &[Vec<u8>], cut_every: usize) -> Vec<Vec<u8>> {
    let mut wire = Vec::new();
    for msg in messages {
        wire.extend_from_slice(&(msg.len() as u32).to_be_bytes());
        wire.extend_from_slice(msg);
    }
    if wire.is_empty() {
        return Vec::new();
    }
    wire.chunks(cut_every.max(1)).map(<[u8]>::to_vec).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: for every sent sequence, the receiver observes exactly
    /// that sequence, for every chunking of the wire bytes.
    #[test]
    fn prop_framing_roundtrip_any_chunking(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16),
        cut_every in 1usize..32,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let channel = chunked(resplit(&messages, cut_every));
            let stream = FramedStream::new("prop-in-1".into(), channel, 1024 * 1024);
            for expected in &messages {
                let got = stream.receive().await.expect("framed message");
                prop_assert_eq!(&got, expected);
            }
            Ok(())
        })?;
    }

    /// Property: message boundaries survive even when every frame arrives
    /// byte by byte.
    #[test]
    fn prop_framing_byte_by_byte(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..8),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let channel = chunked(resplit(&messages, 1));
            let stream = FramedStream::new("prop-in-2".into(), channel, 1024 * 1024);
            for expected in &messages {
                let got = stream.receive().await.expect("framed message");
                prop_assert_eq!(&got, expected);
            }
            Ok(())
        })?;
    }
}
