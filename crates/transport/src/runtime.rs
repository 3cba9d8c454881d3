//! Process-wide relay runtime coordination
//!
//! A lazy singleton with three fields: one-shot runtime initialization,
//! the set of in-flight shutdown cleanups, and an active-endpoint counter.
//! Multiple transport instances in one process share it; a fresh
//! `initialize` awaits every outstanding cleanup before creating its
//! endpoint, so a new endpoint can never race a teardown after a hot
//! reload.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use peervault_core::{EndpointProvider, Result, TransportError};
use tokio::sync::OnceCell;
use tracing::debug;

type CleanupFuture = Shared<BoxFuture<'static, ()>>;

pub(crate) struct RuntimeState {
    init: OnceCell<()>,
    pending_cleanups: StdMutex<Vec<(u64, CleanupFuture)>>,
    cleanup_ids: AtomicU64,
    active_endpoints: AtomicUsize,
}

static RUNTIME: OnceLock<RuntimeState> = OnceLock::new();

pub(crate) fn runtime() -> &'static RuntimeState {
    RUNTIME.get_or_init(|| RuntimeState {
        init: OnceCell::new(),
        pending_cleanups: StdMutex::new(Vec::new()),
        cleanup_ids: AtomicU64::new(1),
        active_endpoints: AtomicUsize::new(0),
    })
}

impl RuntimeState {
    /// Initialize the underlying relay runtime once per process. Concurrent
    /// callers share the one-shot; only the first performs work.
    pub(crate) async fn ensure_initialized(
        &self,
        provider: &Arc<dyn EndpointProvider>,
    ) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                debug!("initializing relay runtime");
                provider.initialize_runtime().await
            })
            .await
            .map_err(|e| match e {
                TransportError::RuntimeNotReady(_) => e,
                other => TransportError::RuntimeNotReady(other.to_string()),
            })?;
        Ok(())
    }

    /// Await every in-flight shutdown cleanup. Futures are `Shared`, so this
    /// never steals a completion from the shutdown that registered it.
    pub(crate) async fn await_cleanups(&self) {
        let snapshot: Vec<CleanupFuture> = {
            let pending = self.pending_cleanups.lock().expect("cleanup lock");
            pending.iter().map(|(_, f)| f.clone()).collect()
        };
        if !snapshot.is_empty() {
            debug!(count = snapshot.len(), "awaiting outstanding cleanups");
        }
        for cleanup in snapshot {
            cleanup.await;
        }
    }

    /// Track a shutdown cleanup until it resolves, then drop it from the
    /// set. Returns the shared handle for the caller to await.
    pub(crate) fn register_cleanup(&self, fut: BoxFuture<'static, ()>) -> CleanupFuture {
        let id = self.cleanup_ids.fetch_add(1, Ordering::Relaxed);
        let shared = fut.shared();
        self.pending_cleanups
            .lock()
            .expect("cleanup lock")
            .push((id, shared.clone()));

        let watcher = shared.clone();
        tokio::spawn(async move {
            watcher.await;
            let pending = &runtime().pending_cleanups;
            pending
                .lock()
                .expect("cleanup lock")
                .retain(|(entry_id, _)| *entry_id != id);
        });

        shared
    }

    pub(crate) fn endpoint_created(&self) {
        self.active_endpoints.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn endpoint_released(&self) {
        // Diagnostics only; tolerate double release from racing teardowns.
        let _ = self
            .active_endpoints
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Active endpoints in this process. Surfaces in diagnostics only.
    pub(crate) fn active_endpoint_count(&self) -> usize {
        self.active_endpoints.load(Ordering::SeqCst)
    }
}
