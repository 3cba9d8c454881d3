//! Incoming-stream dispatch
//!
//! Shared by the relay and WebRTC peer connections: a FIFO of pending
//! streams, a FIFO of accept waiters, and persistent subscribers with a
//! single-owner delivery policy.
//!
//! Waiters are paired resolve/reject records (`oneshot` senders completed
//! with a `Result`), never bare callbacks indexed into a shifting array, so
//! rejection on close cannot mis-route.
//!
//! Single-owner policy: when the first subscriber registers, the queued
//! backlog drains to it synchronously in FIFO order; streams arriving while
//! subscribers exist are delivered to the first subscriber only. This keeps
//! two handlers from racing on the same stream's `receive()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use peervault_core::{Result, TransportError};
use tokio::sync::oneshot;
use tracing::debug;

use crate::stream::PeerStream;
use crate::subscription::{invoke, SubscriberList, Subscription};

type StreamArc = Arc<dyn PeerStream>;
type Waiter = oneshot::Sender<Result<StreamArc>>;

#[derive(Default)]
struct Queues {
    pending: VecDeque<StreamArc>,
    waiters: VecDeque<Waiter>,
    closed_with: Option<TransportError>,
}

pub(crate) struct StreamDispatcher {
    queues: StdMutex<Queues>,
    subscribers: SubscriberList<StreamArc>,
}

impl StreamDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            queues: StdMutex::new(Queues::default()),
            subscribers: SubscriberList::new(),
        }
    }

    /// Route one incoming stream: a parked waiter wins, else the first
    /// subscriber, else the pending queue.
    pub(crate) fn dispatch(&self, stream: StreamArc) {
        let mut stream = stream;
        loop {
            let verdict = {
                let mut queues = self.queues.lock().expect("dispatch lock");
                if let Some(err) = &queues.closed_with {
                    Verdict::Drop(err.clone())
                } else if let Some(waiter) = queues.waiters.pop_front() {
                    Verdict::Waiter(waiter)
                } else if let Some(handler) = self.subscribers.first() {
                    Verdict::Subscriber(handler)
                } else {
                    queues.pending.push_back(stream.clone());
                    Verdict::Queued
                }
            };

            match verdict {
                Verdict::Waiter(waiter) => match waiter.send(Ok(stream)) {
                    Ok(()) => return,
                    // Waiter cancelled between queueing and delivery; retry.
                    Err(Ok(returned)) => stream = returned,
                    Err(Err(_)) => unreachable!("dispatch only sends Ok"),
                },
                Verdict::Subscriber(handler) => {
                    invoke(&handler, stream);
                    return;
                }
                Verdict::Queued => return,
                Verdict::Drop(err) => {
                    debug!(error = %err, "dropping stream dispatched after close");
                    return;
                }
            }
        }
    }

    /// Pop a queued stream, or park until one arrives. Parked waiters are
    /// rejected with the connection's close reason on teardown.
    pub(crate) async fn accept(&self) -> Result<StreamArc> {
        let rx = {
            let mut queues = self.queues.lock().expect("dispatch lock");
            if let Some(err) = &queues.closed_with {
                return Err(err.clone());
            }
            if let Some(stream) = queues.pending.pop_front() {
                return Ok(stream);
            }
            let (tx, rx) = oneshot::channel();
            queues.waiters.push_back(tx);
            rx
        };

        match rx.await {
            Ok(result) => result,
            // Dispatcher dropped without completing us; treat as closed.
            Err(_) => Err(TransportError::StreamClosed {
                stream_id: "accept".into(),
            }),
        }
    }

    /// Register a persistent subscriber. The first subscriber receives the
    /// queued backlog synchronously in FIFO order; later subscribers get
    /// nothing until they become first.
    pub(crate) fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(StreamArc) + Send + Sync + 'static,
    {
        let was_empty = self.subscribers.is_empty();
        let subscription = self.subscribers.subscribe(handler);

        if was_empty {
            let backlog: Vec<StreamArc> = {
                let mut queues = self.queues.lock().expect("dispatch lock");
                queues.pending.drain(..).collect()
            };
            if let Some(handler) = self.subscribers.first() {
                for stream in backlog {
                    invoke(&handler, stream);
                }
            }
        }

        subscription
    }

    /// Reject every parked waiter with `err`, drop the backlog, and refuse
    /// further dispatches. Returns the backlog so the caller can close the
    /// queued streams.
    pub(crate) fn shut_down(&self, err: TransportError) -> Vec<StreamArc> {
        let (waiters, backlog) = {
            let mut queues = self.queues.lock().expect("dispatch lock");
            queues.closed_with = Some(err.clone());
            let waiters: Vec<Waiter> = queues.waiters.drain(..).collect();
            let backlog: Vec<StreamArc> = queues.pending.drain(..).collect();
            (waiters, backlog)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        self.subscribers.clear();
        backlog
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.queues.lock().expect("dispatch lock").pending.len()
    }
}

enum Verdict {
    Waiter(Waiter),
    Subscriber(Arc<dyn Fn(StreamArc) + Send + Sync>),
    Queued,
    Drop(TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RelayBackedStream;
    use async_trait::async_trait;
    use peervault_core::{NodeId, RelayStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullStream;

    #[async_trait]
    impl RelayStream for NullStream {
        async fn send(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn receive(&mut self) -> Result<Vec<u8>> {
            Err(TransportError::StreamClosed {
                stream_id: "null".into(),
            })
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn stream(id: &str) -> StreamArc {
        RelayBackedStream::new(id.into(), Box::new(NullStream))
    }

    #[tokio::test]
    async fn queued_stream_pops_before_parking() {
        let dispatcher = StreamDispatcher::new();
        dispatcher.dispatch(stream("a-in-1"));
        assert_eq!(dispatcher.pending_count(), 1);

        let got = dispatcher.accept().await.unwrap();
        assert_eq!(got.id(), "a-in-1");
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn parked_waiter_receives_next_dispatch() {
        let dispatcher = Arc::new(StreamDispatcher::new());
        let d = dispatcher.clone();
        let waiter = tokio::spawn(async move { d.accept().await });

        tokio::task::yield_now().await;
        dispatcher.dispatch(stream("a-in-2"));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), "a-in-2");
    }

    #[tokio::test]
    async fn first_subscriber_drains_backlog_in_order() {
        let dispatcher = StreamDispatcher::new();
        dispatcher.dispatch(stream("a-in-1"));
        dispatcher.dispatch(stream("a-in-2"));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_first = seen.clone();
        let _first = dispatcher.subscribe(move |s| {
            seen_first.lock().unwrap().push(s.id().to_string());
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a-in-1".to_string(), "a-in-2".to_string()]
        );
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn single_owner_delivery() {
        let dispatcher = StreamDispatcher::new();

        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let f = first_hits.clone();
        let _s1 = dispatcher.subscribe(move |_| {
            f.fetch_add(1, Ordering::Relaxed);
        });
        let s = second_hits.clone();
        let _s2 = dispatcher.subscribe(move |_| {
            s.fetch_add(1, Ordering::Relaxed);
        });

        dispatcher.dispatch(stream("a-in-1"));
        dispatcher.dispatch(stream("a-in-2"));

        assert_eq!(first_hits.load(Ordering::Relaxed), 2);
        assert_eq!(second_hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn later_subscriber_gets_no_backlog() {
        let dispatcher = StreamDispatcher::new();
        dispatcher.dispatch(stream("a-in-1"));

        let _first = dispatcher.subscribe(|_| {});
        let second_hits = Arc::new(AtomicUsize::new(0));
        let s = second_hits.clone();
        let _second = dispatcher.subscribe(move |_| {
            s.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(second_hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_every_parked_waiter() {
        let dispatcher = Arc::new(StreamDispatcher::new());
        let peer = NodeId::from_bytes([3; 32]);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move { d.accept().await }));
        }
        tokio::task::yield_now().await;

        dispatcher.shut_down(TransportError::ConnectionLost { peer });

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err, TransportError::ConnectionLost { peer });
        }
    }

    #[tokio::test]
    async fn accept_after_shutdown_fails_fast() {
        let dispatcher = StreamDispatcher::new();
        let peer = NodeId::from_bytes([4; 32]);
        dispatcher.shut_down(TransportError::ConnectionClosed { peer });

        let err = dispatcher.accept().await.unwrap_err();
        assert_eq!(err, TransportError::ConnectionClosed { peer });
    }
}
