//! Recorders that capture what an engine delivers.
//!
//! [`SnapshotLog`] plays the subscriber, [`OperationLog`] sits in the
//! exchange chain. Both are cheap to clone; clones share the same log.

use fetchflow_core::{FetchError, Operation, State};
use fetchflow_runtime::{Exchange, ExchangeContext, Next};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// How long the `wait_for*` helpers wait before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait until `ready` returns `Some`, re-checking every time `notify` fires.
#[allow(clippy::panic)] // Test helper
async fn wait_until<T>(notify: &Notify, what: &str, mut ready: impl FnMut() -> Option<T>) -> T {
    let wait = async {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = ready() {
                return found;
            }
            notified.await;
        }
    };

    match tokio::time::timeout(WAIT_TIMEOUT, wait).await {
        Ok(found) => found,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// One call of a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// State passed to the subscriber
    pub state: State,
    /// Data passed to the subscriber
    pub data: Option<Value>,
    /// Error passed to the subscriber (only on reject)
    pub error: Option<FetchError>,
}

#[derive(Default)]
struct SnapshotInner {
    deliveries: Mutex<Vec<Delivery>>,
    notify: Notify,
}

/// A subscriber that records every call.
///
/// # Example
///
/// ```
/// use fetchflow_core::{Request, State};
/// use fetchflow_runtime::{handler_fn, Engine, Source};
/// use fetchflow_testing::SnapshotLog;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = Engine::new(handler_fn(|_, _| Ok(Source::value(json!(1)))));
/// let log = SnapshotLog::new();
/// let _handle = engine.subscribe(&Request::from_id("one"), log.subscriber());
///
/// log.wait_for_state(State::Completed).await;
/// assert_eq!(log.states(), vec![State::Pending, State::Completed]);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct SnapshotLog {
    inner: Arc<SnapshotInner>,
}

impl SnapshotLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A subscriber appending to this log.
    #[must_use]
    pub fn subscriber(
        &self,
    ) -> impl Fn(State, Option<&Value>, Option<&FetchError>) + Send + Sync + use<> {
        let inner = Arc::clone(&self.inner);
        move |state, data, error| {
            lock(&inner.deliveries).push(Delivery {
                state,
                data: data.cloned(),
                error: error.cloned(),
            });
            inner.notify.notify_waiters();
        }
    }

    /// Everything delivered so far.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.inner.deliveries).clone()
    }

    /// States delivered so far, in order.
    #[must_use]
    pub fn states(&self) -> Vec<State> {
        lock(&self.inner.deliveries).iter().map(|d| d.state).collect()
    }

    /// The most recent delivery.
    #[must_use]
    pub fn last(&self) -> Option<Delivery> {
        lock(&self.inner.deliveries).last().cloned()
    }

    /// Number of deliveries so far.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.deliveries).len()
    }

    /// Whether nothing was delivered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` deliveries were recorded.
    ///
    /// # Panics
    ///
    /// Panics after [`WAIT_TIMEOUT`].
    pub async fn wait_for(&self, count: usize) -> Vec<Delivery> {
        wait_until(&self.inner.notify, "deliveries", move || {
            let deliveries = lock(&self.inner.deliveries);
            (deliveries.len() >= count).then(|| deliveries.clone())
        })
        .await
    }

    /// Wait until `state` was delivered and return that delivery.
    ///
    /// # Panics
    ///
    /// Panics after [`WAIT_TIMEOUT`].
    pub async fn wait_for_state(&self, state: State) -> Delivery {
        wait_until(&self.inner.notify, state.as_str(), move || {
            lock(&self.inner.deliveries)
                .iter()
                .find(|d| d.state == state)
                .cloned()
        })
        .await
    }
}

impl std::fmt::Debug for SnapshotLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotLog")
            .field("states", &self.states())
            .finish()
    }
}

#[derive(Default)]
struct OperationInner {
    operations: Mutex<Vec<Operation>>,
    notify: Notify,
}

/// An exchange that records every operation passing through and forwards it.
///
/// Put it first in the chain to see operations as dispatched, including the
/// ones the fetch exchange later ignores.
#[derive(Clone, Default)]
pub struct OperationLog {
    inner: Arc<OperationInner>,
}

impl OperationLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything seen so far.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.inner.operations).clone()
    }

    /// Forget everything seen so far.
    pub fn clear(&self) {
        lock(&self.inner.operations).clear();
    }

    /// Wait until at least `count` operations were recorded.
    ///
    /// # Panics
    ///
    /// Panics after [`WAIT_TIMEOUT`].
    pub async fn wait_for(&self, count: usize) -> Vec<Operation> {
        wait_until(&self.inner.notify, "operations", move || {
            let operations = lock(&self.inner.operations);
            (operations.len() >= count).then(|| operations.clone())
        })
        .await
    }
}

impl Exchange for OperationLog {
    fn name(&self) -> &str {
        "operation-log"
    }

    fn handle(&self, op: Operation, _cx: &ExchangeContext<'_>, next: Next<'_>) {
        lock(&self.inner.operations).push(op.clone());
        self.inner.notify.notify_waiters();
        next.run(op);
    }
}

impl std::fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("operations", &lock(&self.inner.operations).len())
            .finish()
    }
}
