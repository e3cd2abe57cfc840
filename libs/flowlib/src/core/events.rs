use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

struct Entry<T> {
    id: u64,
    enabled: bool,
    callback: Box<dyn FnMut(&T) + Send>,
}

/// Ordered set of callbacks for one kind of notification.
///
/// Dispatch runs inline on the calling thread, in registration order.
/// A callback that panics is disabled and skipped from then on; the
/// remaining callbacks still run.
pub struct ListenerSet<T> {
    owner: String,
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> ListenerSet<T> {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Register a callback and hand back the id used to remove it.
    pub fn add(&mut self, callback: impl FnMut(&T) + Send + 'static) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            enabled: true,
            callback: Box::new(callback),
        });
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dispatch(&mut self, event: &T) {
        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.callback)(event)));
            if outcome.is_err() {
                entry.enabled = false;
                warn!(
                    owner = %self.owner,
                    listener = entry.id,
                    "listener panicked, disabling it"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_in_registration_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut set = ListenerSet::new("order_test");
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            set.add(move |_: &u32| order.lock().push(tag));
        }
        set.dispatch(&0);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_by_id() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut set = ListenerSet::new("remove_test");
        let hits_a = hits.clone();
        let id = set.add(move |_: &u32| {
            hits_a.fetch_add(1, Ordering::Relaxed);
        });
        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.dispatch(&0);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_panicking_listener_is_disabled_others_run() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut set = ListenerSet::new("panic_test");
        set.add(|_: &u32| panic!("boom"));
        let hits_b = hits.clone();
        set.add(move |_: &u32| {
            hits_b.fetch_add(1, Ordering::Relaxed);
        });
        set.dispatch(&0);
        set.dispatch(&0);
        // The healthy listener ran on both dispatches.
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(set.len(), 2);
    }
}
