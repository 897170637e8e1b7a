//! Listener registry
//!
//! Listeners are plain callbacks invoked with no arguments after every
//! completed cycle; they read whatever they need from the coordinator.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use indexmap::{IndexMap, IndexSet};
use tracing::error;

pub type ListenerCallback = Arc<dyn Fn() + Send + Sync>;

/// A unique identifier for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    callback: ListenerCallback,
    context: Option<String>,
}

pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<IndexMap<ListenerId, Listener>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(IndexMap::new()),
        }
    }

    pub(crate) fn add(
        self: &Arc<Self>,
        callback: ListenerCallback,
        context: Option<String>,
    ) -> RemoveListener {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, Listener { callback, context });
        RemoveListener {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: ListenerId) -> bool {
        self.lock().shift_remove(&id).is_some()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn contexts(&self) -> IndexSet<String> {
        self.lock()
            .values()
            .filter_map(|listener| listener.context.clone())
            .collect()
    }

    /// Call every listener once
    ///
    /// Runs without holding the lock, so a callback may add or remove
    /// listeners. A listener removed by an earlier callback is skipped.
    pub(crate) fn notify(&self, coordinator: &str) {
        let snapshot: Vec<(ListenerId, ListenerCallback)> = self
            .lock()
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(&listener.callback)))
            .collect();

        for (id, callback) in snapshot {
            if !self.lock().contains_key(&id) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!(coordinator = %coordinator, ?id, "Listener panicked during update");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<ListenerId, Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle returned when registering a listener
///
/// Dropping the handle keeps the listener registered; call
/// [`remove`](RemoveListener::remove) to unsubscribe.
#[must_use = "the listener stays registered until `remove` is called"]
#[derive(Debug, Clone)]
pub struct RemoveListener {
    id: ListenerId,
    registry: Weak<ListenerRegistry>,
}

impl RemoveListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unsubscribe; later calls do nothing
    ///
    /// Returns whether this call removed the listener.
    pub fn remove(&self) -> bool {
        self.registry
            .upgrade()
            .map_or(false, |registry| registry.remove(self.id))
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (ListenerCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let callback: ListenerCallback = Arc::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn test_notify_and_remove() {
        let registry = Arc::new(ListenerRegistry::new());
        let (a, a_count) = counter();
        let (b, b_count) = counter();
        let remove_a = registry.add(a, None);
        let _remove_b = registry.add(b, None);

        registry.notify("test");
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);

        assert!(remove_a.remove());
        assert!(!remove_a.remove());
        registry.notify("test");
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_contexts_follow_listeners() {
        let registry = Arc::new(ListenerRegistry::new());
        let (a, _) = counter();
        let (b, _) = counter();
        let (c, _) = counter();
        let remove_a = registry.add(a, Some("temperature".into()));
        let _remove_b = registry.add(b, Some("humidity".into()));
        let _remove_c = registry.add(c, Some("temperature".into()));

        let contexts = registry.contexts();
        assert_eq!(contexts.len(), 2);
        assert!(contexts.contains("temperature"));

        remove_a.remove();
        assert!(registry.contexts().contains("temperature"));
    }

    #[test]
    fn test_listener_removed_during_notify_is_skipped() {
        let registry = Arc::new(ListenerRegistry::new());
        let (b, b_count) = counter();
        let slot: Arc<Mutex<Option<RemoveListener>>> = Arc::new(Mutex::new(None));

        let victim = Arc::clone(&slot);
        let _remove_a = registry.add(
            Arc::new(move || {
                if let Some(remove) = victim.lock().unwrap().as_ref() {
                    remove.remove();
                }
            }),
            None,
        );
        *slot.lock().unwrap() = Some(registry.add(b, None));

        registry.notify("test");
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let registry = Arc::new(ListenerRegistry::new());
        let (b, b_count) = counter();
        let _remove_a = registry.add(Arc::new(|| panic!("listener bug")), None);
        let _remove_b = registry.add(b, None);

        registry.notify("test");
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_after_registry_dropped() {
        let registry = Arc::new(ListenerRegistry::new());
        let (a, _) = counter();
        let remove = registry.add(a, None);
        drop(registry);
        assert!(!remove.remove());
    }
}
