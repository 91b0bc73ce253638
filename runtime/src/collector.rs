//! Disposal of requests nobody is watching.
//!
//! The collector only owns timers. What happens when a timer fires is up to
//! the caller of [`InactivityCollector::schedule`]; the engine turns it into
//! a `dispose` operation that travels the normal pipeline.

use fetchflow_core::RequestId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;

#[derive(Debug)]
struct Timer {
    token: u64,
    task: AbortHandle,
}

/// Per-request disposal timers.
///
/// Each id has at most one timer. A timer is identified by a token so that a
/// firing timer which lost a race against [`keep`](Self::keep) or a newer
/// [`schedule`](Self::schedule) can tell it is stale (see
/// [`expire`](Self::expire)).
#[derive(Debug)]
pub struct InactivityCollector {
    max_age: Duration,
    timers: Mutex<HashMap<RequestId, Timer>>,
    next_token: AtomicU64,
}

impl InactivityCollector {
    /// Collector disposing requests after `max_age` without subscribers.
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            timers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// The inactivity window.
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        self.max_age
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Timer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) the timer for `id`.
    ///
    /// After `max_age`, `on_expire` is called with the timer's token. It
    /// should check [`expire`](Self::expire) before acting.
    ///
    /// Must be called within a Tokio runtime.
    pub fn schedule<F>(&self, id: &RequestId, on_expire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let max_age = self.max_age;

        // Held across the spawn so an immediate expiry waits for the insert.
        let mut timers = self.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(max_age).await;
            on_expire(token);
        });

        if let Some(previous) = timers.insert(
            id.clone(),
            Timer {
                token,
                task: task.abort_handle(),
            },
        ) {
            previous.task.abort();
        }

        tracing::trace!(request = %id, token, ?max_age, "Scheduled disposal");
    }

    /// Cancel the pending disposal of `id`. Returns whether one was pending.
    pub fn keep(&self, id: &RequestId) -> bool {
        match self.lock().remove(id) {
            Some(timer) => {
                timer.task.abort();
                tracing::trace!(request = %id, "Cancelled scheduled disposal");
                true
            },
            None => false,
        }
    }

    /// Claim the timer `token` of `id`.
    ///
    /// Returns `true` exactly once for a timer that is still current, and
    /// forgets it. Stale tokens return `false`.
    pub fn expire(&self, id: &RequestId, token: u64) -> bool {
        let mut timers = self.lock();
        match timers.get(id) {
            Some(timer) if timer.token == token => {
                timers.remove(id);
                true
            },
            _ => false,
        }
    }

    /// Whether a disposal is pending for `id`.
    #[must_use]
    pub fn is_scheduled(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of pending disposals.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

impl Drop for InactivityCollector {
    fn drop(&mut self) {
        for timer in self.lock().values() {
            timer.task.abort();
        }
    }
}
