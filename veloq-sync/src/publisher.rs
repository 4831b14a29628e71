//! Observable values with per-listener unsubscribe handles.
//!
//! `Broadcaster` is the change-notification bus used by the bounds cache;
//! `ProgressPublisher` layers a current value on top of it so that every
//! sync banner reads the same progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::types::SyncProgress;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

struct Registry<T> {
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Detach for Registry<T> {
    fn detach(&self, id: u64) -> bool {
        lock(&self.listeners).remove(&id).is_some()
    }
}

/// Handle for one registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Detach>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Fan-out of values to any number of listeners.
pub struct Broadcaster<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener; keep the returned handle alive to stay subscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.listeners).insert(id, Arc::new(listener));
        let registry: Arc<dyn Detach> = self.registry.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Remove a listener by id. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.registry.detach(id)
    }

    /// Deliver `value` to every listener.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe from inside the callback.
    pub fn publish(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = lock(&self.registry.listeners).values().cloned().collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry.listeners).len()
    }
}

impl<T: 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Stamped {
    /// Sync generation that last wrote `value`
    generation: u64,
    value: SyncProgress,
}

/// Single shared `SyncProgress` value.
///
/// Only the sync coordinator writes; any number of screens subscribe.
/// Writes carry the sync generation, and a write from an older generation
/// than the last one is dropped.
pub struct ProgressPublisher {
    current: Mutex<Stamped>,
    changes: Broadcaster<SyncProgress>,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Stamped {
                generation: 0,
                value: SyncProgress::idle(),
            }),
            changes: Broadcaster::new(),
        }
    }

    /// Current progress snapshot.
    pub fn get(&self) -> SyncProgress {
        lock(&self.current).value.clone()
    }

    /// Subscribe to progress changes. The listener is called once right away
    /// with the current value so late-mounting screens render immediately.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        let current = self.get();
        listener(&current);
        self.changes.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.changes.unsubscribe(id)
    }

    pub fn listener_count(&self) -> usize {
        self.changes.listener_count()
    }

    /// Replace the progress value on behalf of sync `generation`, notifying
    /// listeners if it changed. Returns false if the write was stale.
    pub(crate) fn publish(&self, generation: u64, progress: SyncProgress) -> bool {
        {
            let mut current = lock(&self.current);
            if generation < current.generation {
                return false;
            }
            current.generation = generation;
            if current.value == progress {
                return true;
            }
            current.value = progress.clone();
        }
        self.changes.publish(&progress);
        true
    }

    /// Back to `Idle/0/0`.
    pub(crate) fn reset(&self, generation: u64) {
        self.publish(generation, SyncProgress::idle());
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}
