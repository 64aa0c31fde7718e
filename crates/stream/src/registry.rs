use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use kdash_core::WireMessage;
use metrics::counter;
use tracing::warn;

/// Callback invoked for every delivered message. An `Err` or a panic is
/// logged and does not affect other listeners.
pub type ListenerFn = dyn Fn(&WireMessage) -> anyhow::Result<()> + Send + Sync;

#[derive(Clone)]
struct Entry {
    id: u64,
    f: Arc<ListenerFn>,
}

/// Listener set. Dispatch iterates a snapshot, so callbacks may subscribe or
/// unsubscribe (themselves included) while a message is being delivered.
pub(crate) struct Registry {
    next_id: AtomicU64,
    entries: ArcSwap<Vec<Entry>>,
    closed: AtomicBool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self { next_id: AtomicU64::new(1), entries: ArcSwap::from_pointee(Vec::new()), closed: AtomicBool::new(false) }
    }

    pub(crate) fn add(&self, f: Arc<ListenerFn>) -> Option<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry { id, f };
        self.entries.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(entry.clone());
            next
        });
        // Lost a race with close(): do not keep the listener alive.
        if self.closed.load(Ordering::SeqCst) {
            self.remove(id);
            return None;
        }
        Some(id)
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let prev = self.entries.rcu(|cur| cur.iter().filter(|e| e.id != id).cloned().collect::<Vec<_>>());
        prev.iter().any(|e| e.id == id)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.store(Arc::new(Vec::new()));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub(crate) fn dispatch(&self, msg: &WireMessage) {
        let snapshot = self.entries.load_full();
        for entry in snapshot.iter() {
            match catch_unwind(AssertUnwindSafe(|| (entry.f)(msg))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    counter!("stream_listener_failures_total", 1u64);
                    warn!(listener = entry.id, error = %e, event = %msg.event_type, "stream: listener failed");
                }
                Err(panic) => {
                    counter!("stream_listener_failures_total", 1u64);
                    warn!(listener = entry.id, panic = %panic_message(&*panic), event = %msg.event_type, "stream: listener panicked");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned by [`EventStreamClient::subscribe`](crate::EventStreamClient::subscribe).
///
/// Unsubscribes when dropped; keep it alive for as long as messages are wanted.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: Option<u64>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub(crate) fn new(id: Option<u64>, registry: Weak<Registry>) -> Self {
        Self { id, registry }
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        match (self.id, self.registry.upgrade()) {
            (Some(id), Some(reg)) => reg.entries.load().iter().any(|e| e.id == id),
            _ => false,
        }
    }

    /// Remove the listener. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if let (Some(id), Some(reg)) = (self.id.take(), self.registry.upgrade()) {
            reg.remove(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
