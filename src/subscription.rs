//! Per-key observer registration and change fan-out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tracing::warn;

use crate::state::QueryState;
use crate::storage::StoredQuery;

/// Callback invoked with the entry's present state after every change.
pub type Observer = Arc<dyn Fn(&QueryState) + Send + Sync>;

/// Observers registered on one entry.
#[derive(Default)]
pub(crate) struct Observers {
    slots: Mutex<Slab<Observer>>,
}

impl Observers {
    pub(crate) fn insert(&self, observer: Observer) -> usize {
        self.slots.lock().insert(observer)
    }

    pub(crate) fn remove(&self, id: usize) -> bool {
        self.slots.lock().try_remove(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Copy of the current registrations. Fan-out iterates this copy with the
    /// lock released, so observers may subscribe or unsubscribe (themselves
    /// included) while being notified.
    pub(crate) fn snapshot(&self) -> Vec<Observer> {
        self.slots
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }
}

/// Invoke every observer with `state`, isolating panics per observer.
pub(crate) fn fan_out(key: &str, observers: &[Observer], state: &QueryState) {
    for observer in observers {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer(state))) {
            warn!(
                key,
                panic = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("(non-string panic)"),
                "observer panicked during notification"
            );
        }
    }
}

/// Handle to a registered observer.
///
/// The observer stays registered until [`unsubscribe`](Self::unsubscribe) is
/// called or the handle is dropped.
#[must_use = "dropping a Subscription unsubscribes its observer"]
pub struct Subscription {
    entry: Weak<StoredQuery>,
    id: Option<usize>,
}

impl Subscription {
    pub(crate) fn new(entry: &Arc<StoredQuery>, id: usize) -> Self {
        Self {
            entry: Arc::downgrade(entry),
            id: Some(id),
        }
    }

    /// Remove the observer. Notifications already being delivered finish
    /// against their own snapshot.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Whether the observer is still registered.
    pub fn is_active(&self) -> bool {
        self.id.is_some() && self.entry.strong_count() > 0
    }

    /// Keep the observer registered for the lifetime of its entry.
    pub fn detach(mut self) {
        self.id = None;
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(entry) = self.entry.upgrade() {
                entry.observers().remove(id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
