use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::error::panic_message;
use crate::types::LifecycleEvent;

/// Synchronous receiver of lifecycle events.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> EventListener for F
where
    F: Fn(&LifecycleEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Process-local event bus.
///
/// Registered listeners are invoked synchronously, in registration order,
/// before `publish` returns. The bus only holds `Weak` references: dropping
/// the last `Arc` to a listener unregisters it. A panicking listener is
/// logged and skipped.
///
/// Consumers on other tasks can also `subscribe()` to a broadcast stream.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<LifecycleEvent>,
    listeners: Mutex<Vec<(ListenerId, Weak<dyn EventListener>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            tx,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener. The bus does not extend its lifetime.
    pub fn add_listener<L: EventListener>(&self, listener: &Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let as_dyn: Arc<dyn EventListener> = listener.clone();
        let weak = Arc::downgrade(&as_dyn);
        self.lock_listeners().push((id, weak));
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of listeners that are still alive.
    pub fn listener_count(&self) -> usize {
        self.lock_listeners()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .count()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // Snapshot so a listener may add/remove listeners without deadlocking.
        let live: Vec<Arc<dyn EventListener>> = {
            let mut listeners = self.lock_listeners();
            listeners.retain(|(_, w)| w.strong_count() > 0);
            listeners.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };

        for listener in live {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                warn!(
                    event = %event.kind,
                    source = %event.source,
                    error = %panic_message(payload.as_ref()),
                    "Event listener panicked"
                );
            }
        }

        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Weak<dyn EventListener>)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
