//! Hierarchical `source.event` notification bus (spec §4.10, component C11).
//!
//! Grounded on `examples/original_source/include/events.h`'s three listener
//! granularities. Listeners registered at any of the three tiers fire, for a
//! given `(source, event)`, in the order they were registered across all
//! tiers combined — a listener is identified by a monotonically increasing
//! id, so sorting by id reproduces registration order without a separate
//! sequence structure.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque payload handed to listeners; downcast with [`EventPayload::downcast_ref`].
pub type EventPayload = Arc<dyn Any + Send + Sync>;

/// A registered callback. MUST NOT block on the reader thread (spec §4.10) —
/// it may mutate the cache or enqueue work but must not perform unbounded I/O.
pub type Listener = Arc<dyn Fn(&str, &str, &EventPayload) + Send + Sync>;

#[derive(Clone)]
enum Scope {
    Any,
    Source(String),
    Event(String, String),
}

impl Scope {
    fn matches(&self, source: &str, event: &str) -> bool {
        match self {
            Scope::Any => true,
            Scope::Source(s) => s == source,
            Scope::Event(s, e) => s == source && e == event,
        }
    }
}

struct Registration {
    id: u64,
    scope: Scope,
    listener: Listener,
}

/// Handle returned from a `subscribe_*` call; pass to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// The `source.event` bus. A single instance is shared (via `Arc`) across
/// every component in the [`crate::engine::Engine`] context.
pub struct EventBus {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, scope: Scope, listener: Listener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.lock().push(Registration { id, scope, listener });
        ListenerId(id)
    }

    /// Fires for every event from every source.
    pub fn subscribe_any(&self, listener: impl Fn(&str, &str, &EventPayload) + Send + Sync + 'static) -> ListenerId {
        self.register(Scope::Any, Arc::new(listener))
    }

    /// Fires for any event from `source`.
    pub fn subscribe_source(&self, source: impl Into<String>, listener: impl Fn(&str, &str, &EventPayload) + Send + Sync + 'static) -> ListenerId {
        self.register(Scope::Source(source.into()), Arc::new(listener))
    }

    /// Fires only for `source.event`.
    pub fn subscribe(&self, source: impl Into<String>, event: impl Into<String>, listener: impl Fn(&str, &str, &EventPayload) + Send + Sync + 'static) -> ListenerId {
        self.register(Scope::Event(source.into(), event.into()), Arc::new(listener))
    }

    /// Fires `events.unregistered` (carrying the removed id) immediately
    /// before removing the listener, then removes it. No-op if already
    /// removed.
    pub fn unsubscribe(&self, id: ListenerId) {
        let existed = self.registrations.lock().iter().any(|r| r.id == id.0);
        if !existed {
            return;
        }
        self.fire("events", "unregistered", Arc::new(id.0));
        self.registrations.lock().retain(|r| r.id != id.0);
    }

    /// Runs every matching listener, in registration order, on the calling
    /// thread. Listeners registered during this call do not run for it —
    /// the registration list is snapshotted before iterating.
    pub fn fire(&self, source: &str, event: &str, payload: EventPayload) {
        let mut matching: Vec<(u64, Listener)> = self
            .registrations
            .lock()
            .iter()
            .filter(|r| r.scope.matches(source, event))
            .map(|r| (r.id, r.listener.clone()))
            .collect();
        matching.sort_by_key(|(id, _)| *id);
        for (_, listener) in matching {
            listener(source, event, &payload);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
