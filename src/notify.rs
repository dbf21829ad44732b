//! Fan-out broadcast with stable deregistration tokens.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque registration token returned by `subscribe`.
///
/// Tokens are never reused; unsubscribing an already-removed token is a
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// A registered listener callback.
pub type Listener<T> = Box<dyn Fn(&T) + Send>;

/// Synchronous fan-out of values to registered listeners.
///
/// Listeners are weak observers: the notifier owns the registry
/// exclusively and listeners never own engine state. Per-listener
/// invocation order is FIFO (registration order); there is no ordering
/// guarantee across distinct listeners.
pub struct ChangeNotifier<T> {
    listeners: Mutex<BTreeMap<SubscriptionId, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for ChangeNotifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChangeNotifier<T> {
    /// Create a notifier with no listeners.
    pub fn new() -> Self {
        ChangeNotifier {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener. Never errors.
    pub fn subscribe(&self, listener: Listener<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        id
    }

    /// Remove the listener registered under `id`. Never errors; removing
    /// an unknown token is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().remove(&id);
    }

    /// Drop every registered listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// True when no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Invoke every current listener once per record, synchronously.
    ///
    /// A panicking listener is caught and logged, never propagated — one
    /// failing listener cannot block delivery to the others, nor affect
    /// the caller's own success. Listeners must not call back into the
    /// registry (the lock is held for the duration of the emit).
    pub fn emit(&self, records: &[T]) {
        let listeners = self.listeners.lock();
        for record in records {
            for (id, listener) in listeners.iter() {
                if panic::catch_unwind(AssertUnwindSafe(|| listener(record))).is_err() {
                    log::error!("change listener {id:?} panicked; continuing delivery");
                }
            }
        }
    }
}
