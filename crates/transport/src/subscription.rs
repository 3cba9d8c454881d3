//! Handler registration with drop-based removal
//!
//! Callbacks are registered through `subscribe(handler) -> Subscription`;
//! dropping the subscription removes the handler. Invocation order follows
//! registration order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    handler: Handler<T>,
}

/// An ordered list of subscribers sharing one value type.
pub struct SubscriberList<T> {
    entries: Arc<Mutex<Vec<Entry<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> SubscriberList<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. Returns a guard that removes it on drop.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().expect("subscriber lock").push(Entry {
            id,
            handler: Arc::new(handler),
        });

        let entries = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries
                    .lock()
                    .expect("subscriber lock")
                    .retain(|e| e.id != id);
            }
        })
    }

    /// Snapshot of the earliest-registered handler, if any.
    pub fn first(&self) -> Option<Handler<T>> {
        self.entries
            .lock()
            .expect("subscriber lock")
            .first()
            .map(|e| e.handler.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("subscriber lock").is_empty()
    }

    /// Invoke every handler synchronously in registration order.
    /// Handler panics are logged and swallowed.
    pub fn notify_all(&self, value: T) {
        let snapshot: Vec<Handler<T>> = self
            .entries
            .lock()
            .expect("subscriber lock")
            .iter()
            .map(|e| e.handler.clone())
            .collect();
        for handler in snapshot {
            invoke(&handler, value.clone());
        }
    }

    pub fn clear(&self) {
        self.entries.lock().expect("subscriber lock").clear();
    }
}

impl<T: Clone + Send + 'static> Default for SubscriberList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke a handler, containing panics so a misbehaving callback cannot kill
/// the loop that fired it.
pub(crate) fn invoke<T>(handler: &Handler<T>, value: T) {
    if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
        error!("subscriber callback panicked; continuing");
    }
}

/// Removes its handler when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Keep the handler registered for the lifetime of its list.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
