//! Per-request listener lists.

use fetchflow_core::RequestId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Callback registered with an [`Emitter`].
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifies one registration, returned by [`Emitter::on`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered, synchronous, per-id fan-out.
///
/// `emit` calls the listeners registered for an id in registration order on
/// the calling thread. The list is copied before calling out, so listeners
/// may register or remove listeners (including themselves) while being
/// called; such changes take effect from the next `emit`.
pub struct Emitter<T> {
    listeners: Mutex<HashMap<RequestId, Vec<(ListenerId, Listener<T>)>>>,
    next_id: AtomicU64,
}

impl<T> Emitter<T> {
    /// Create an emitter without listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Vec<(ListenerId, Listener<T>)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` for `id`.
    pub fn on(&self, id: &RequestId, listener: Listener<T>) -> ListenerId {
        let handle = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(id.clone())
            .or_default()
            .push((handle, listener));
        handle
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn off(&self, id: &RequestId, handle: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(id) else {
            return false;
        };

        let before = list.len();
        list.retain(|(registered, _)| *registered != handle);
        let removed = list.len() != before;

        if list.is_empty() {
            listeners.remove(id);
        }
        removed
    }

    /// Call every listener of `id` with `payload`.
    pub fn emit(&self, id: &RequestId, payload: &T) {
        let current: Vec<Listener<T>> = match self.lock().get(id) {
            Some(list) => list.iter().map(|(_, listener)| Arc::clone(listener)).collect(),
            None => return,
        };

        for listener in current {
            listener(payload);
        }
    }

    /// Whether `id` has at least one listener.
    #[must_use]
    pub fn has_subscribers(&self, id: &RequestId) -> bool {
        self.listener_count(id) > 0
    }

    /// Number of listeners registered for `id`.
    #[must_use]
    pub fn listener_count(&self, id: &RequestId) -> usize {
        self.lock().get(id).map_or(0, Vec::len)
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("ids", &self.lock().len())
            .finish_non_exhaustive()
    }
}
