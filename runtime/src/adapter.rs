//! Turning a [`Source`] into operations.
//!
//! Every activation of a source gets an [`Outlet`] and hands back a
//! [`Disposer`]. Operations never go straight into the store: the outlet
//! queues them as jobs on the engine, and each job re-checks the
//! activation's liveness flag when it runs. Disposing flips the flag, so
//! whatever a producer pushed before it noticed the cancellation is dropped
//! at the door.

use crate::engine::Sink;
use crate::metrics::FetchMetrics;
use crate::source::{Observer, Resumable, Source, Subscription};
use fetchflow_core::{FetchError, Meta, Operation, Request, Value};
use futures::{FutureExt, StreamExt};
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;

/// Operations produced by one step of a source.
pub(crate) type Batch = SmallVec<[Operation; 2]>;

/// Called once when an activation has produced its final operations.
///
/// Receives the source back when it can be resumed by a later fetch.
pub(crate) type OnSettle = Arc<dyn Fn(Option<Resumable>) + Send + Sync>;

/// Emission side of one source activation.
#[derive(Clone)]
pub(crate) struct Outlet {
    request: Request,
    sink: Sink,
    live: Arc<AtomicBool>,
    on_settle: OnSettle,
}

impl Outlet {
    pub(crate) fn new(request: Request, sink: Sink, on_settle: OnSettle) -> Self {
        Self {
            request,
            sink,
            live: Arc::new(AtomicBool::new(true)),
            on_settle,
        }
    }

    pub(crate) const fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn put(&self, value: Value, lazy: bool) {
        let op = Operation::put(&self.request, value, Some(Meta { lazy }));
        let live = Arc::clone(&self.live);
        self.sink.schedule(Box::new(move |shared| {
            if live.load(Ordering::Acquire) {
                shared.update(op);
            } else {
                tracing::trace!(%op, "Dropping operation from disposed source");
            }
        }));
    }

    pub(crate) fn complete(&self, data: Option<Value>) {
        self.settle(smallvec![Operation::complete(&self.request, data)], None);
    }

    pub(crate) fn reject(&self, error: FetchError) {
        self.settle(smallvec![Operation::reject(&self.request, error)], None);
    }

    /// Emit the final operations of this activation and release it.
    ///
    /// Operations and release run as one job, so nothing queued behind them
    /// (a "fetch more" from a subscriber, say) can observe the activation
    /// half-finished.
    pub(crate) fn settle(&self, ops: Batch, parked: Option<Resumable>) {
        let live = Arc::clone(&self.live);
        let on_settle = Arc::clone(&self.on_settle);
        self.sink.schedule(Box::new(move |shared| {
            if !live.load(Ordering::Acquire) {
                tracing::trace!(count = ops.len(), "Dropping final operations of disposed source");
                return;
            }
            for op in ops {
                shared.update(op);
            }
            on_settle(parked);
        }));
    }
}

impl fmt::Debug for Outlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outlet")
            .field("request", self.request.id())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// Stops one source activation.
#[derive(Debug)]
pub(crate) struct Disposer {
    live: Arc<AtomicBool>,
    task: Option<AbortHandle>,
    subscription: Option<Subscription>,
}

impl Disposer {
    fn new(outlet: &Outlet) -> Self {
        Self {
            live: Arc::clone(&outlet.live),
            task: None,
            subscription: None,
        }
    }

    fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }

    fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Suppress every further emission, then stop the producer.
    pub(crate) fn dispose(self) {
        self.live.store(false, Ordering::Release);
        if let Some(task) = self.task {
            task.abort();
        }
        if let Some(subscription) = self.subscription {
            subscription.unsubscribe();
        }
    }
}

/// Start one activation of `source`.
///
/// Must be called within a Tokio runtime.
pub(crate) fn adapt(source: Source, outlet: Outlet) -> Disposer {
    let disposer = Disposer::new(&outlet);
    tracing::trace!(request = %outlet.request().id(), kind = %source.kind(), "Adapting source");

    match source {
        Source::Value(value) => {
            outlet.complete(Some(value));
            disposer
        },
        Source::Future(future) => {
            let task = tokio::spawn(resolve(future, outlet));
            disposer.with_task(task.abort_handle())
        },
        Source::Observable(observable) => {
            let subscription = observable.subscribe(Observer::new(outlet));
            disposer.with_subscription(subscription)
        },
        Source::Pull(pull) => {
            let task = tokio::spawn(step(Resumable::Pull(pull), outlet));
            disposer.with_task(task.abort_handle())
        },
        Source::Stream(stream) => {
            let task = tokio::spawn(step(Resumable::Stream(stream), outlet));
            disposer.with_task(task.abort_handle())
        },
    }
}

/// Await `future`, turning a panic into a [`FetchError::Panicked`].
async fn guarded<T, F>(future: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(FetchError::from_panic(panic.as_ref())))
}

async fn resolve<F>(future: F, outlet: Outlet)
where
    F: Future<Output = Result<Value, FetchError>>,
{
    let started = Instant::now();
    let result = guarded(future).await;
    FetchMetrics::record_step("future", started.elapsed());

    match result {
        Ok(value) => outlet.complete(Some(value)),
        Err(error) => outlet.reject(error),
    }
}

/// Pull exactly one item and hand the source back if it can continue.
async fn step(resumable: Resumable, outlet: Outlet) {
    let started = Instant::now();
    let request = outlet.request();

    let (kind, ops, parked): (&'static str, Batch, Option<Resumable>) = match resumable {
        Resumable::Pull(mut pull) => {
            let pulled = guarded(async { pull().await }).await;
            match pulled {
                Ok(Some(value)) => (
                    "pull",
                    smallvec![Operation::put(request, value, Some(Meta::eager()))],
                    Some(Resumable::Pull(pull)),
                ),
                // Nothing this time: park without emitting.
                Ok(None) => ("pull", SmallVec::new(), Some(Resumable::Pull(pull))),
                Err(error) => ("pull", smallvec![Operation::reject(request, error)], None),
            }
        },
        Resumable::Stream(mut stream) => {
            let pulled = guarded(async { stream.next().await.transpose() }).await;
            match pulled {
                Ok(Some(value)) => (
                    "stream",
                    smallvec![Operation::put(request, value, Some(Meta::lazy()))],
                    Some(Resumable::Stream(stream)),
                ),
                Ok(None) => ("stream", smallvec![Operation::complete(request, None)], None),
                Err(error) => ("stream", smallvec![Operation::reject(request, error)], None),
            }
        },
    };

    FetchMetrics::record_step(kind, started.elapsed());
    outlet.settle(ops, parked);
}
