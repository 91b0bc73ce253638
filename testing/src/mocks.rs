//! Handlers and sources you control from the test body.

use fetchflow_core::{FetchError, Request};
use fetchflow_runtime::{Handler, HandlerContext, Observer, Source, Subscription};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Fallback = Arc<dyn Fn(&Request) -> Result<Source, FetchError> + Send + Sync>;

#[derive(Default)]
struct ScriptedInner {
    script: Mutex<VecDeque<Result<Source, FetchError>>>,
    fallback: Mutex<Option<Fallback>>,
    requests: Mutex<Vec<Request>>,
}

/// A handler answering from a queue of prepared sources.
///
/// Every invocation is recorded. Once the queue is empty the
/// [`always`](Self::always) fallback answers; without one the invocation
/// fails. Clones share the queue and the record, so keep one clone in the
/// test and hand the other to the engine.
///
/// # Example
///
/// ```
/// use fetchflow_core::{FetchError, Request};
/// use fetchflow_runtime::Engine;
/// use fetchflow_testing::ScriptedHandler;
/// use serde_json::json;
///
/// let handler = ScriptedHandler::new();
/// handler
///     .then_value(json!(1))
///     .then_fail(FetchError::msg("second call fails"));
///
/// let engine = Engine::new(handler.clone());
/// # drop(engine);
/// assert_eq!(handler.invocations(), 0);
/// ```
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    inner: Arc<ScriptedInner>,
}

impl ScriptedHandler {
    /// A handler with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next invocation with `source`.
    pub fn then(&self, source: Source) -> &Self {
        lock(&self.inner.script).push_back(Ok(source));
        self
    }

    /// Answer the next invocation with a plain value.
    pub fn then_value(&self, value: Value) -> &Self {
        self.then(Source::value(value))
    }

    /// Fail the next invocation synchronously.
    pub fn then_fail(&self, error: FetchError) -> &Self {
        lock(&self.inner.script).push_back(Err(error));
        self
    }

    /// Answer with `f` once the script is used up.
    pub fn always<F>(&self, f: F) -> &Self
    where
        F: Fn(&Request) -> Result<Source, FetchError> + Send + Sync + 'static,
    {
        *lock(&self.inner.fallback) = Some(Arc::new(f));
        self
    }

    /// How often the handler was invoked.
    #[must_use]
    pub fn invocations(&self) -> usize {
        lock(&self.inner.requests).len()
    }

    /// The requests it was invoked with, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.inner.requests).clone()
    }

    /// Prepared answers not used yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        lock(&self.inner.script).len()
    }
}

impl Handler for ScriptedHandler {
    fn handle(&self, request: &Request, _cx: &HandlerContext) -> Result<Source, FetchError> {
        lock(&self.inner.requests).push(request.clone());

        if let Some(next) = lock(&self.inner.script).pop_front() {
            return next;
        }

        let fallback = lock(&self.inner.fallback).clone();
        match fallback {
            Some(f) => f(request),
            None => Err(FetchError::msg(format!(
                "no scripted source left for {}",
                request.id()
            ))),
        }
    }
}

impl fmt::Debug for ScriptedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedHandler")
            .field("invocations", &self.invocations())
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Settles a [`deferred`] source.
#[derive(Debug)]
pub struct Resolver {
    tx: oneshot::Sender<Result<Value, FetchError>>,
}

impl Resolver {
    /// Resolve with `value`. Returns `false` if the source is gone.
    pub fn resolve(self, value: Value) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    /// Reject with `error`. Returns `false` if the source is gone.
    pub fn reject(self, error: FetchError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }
}

/// A future source the test settles by hand.
///
/// Dropping the [`Resolver`] without settling rejects the source.
#[must_use]
pub fn deferred() -> (Source, Resolver) {
    let (tx, rx) = oneshot::channel();
    let source = Source::future(async move {
        rx.await
            .unwrap_or_else(|_| Err(FetchError::msg("deferred source dropped")))
    });
    (source, Resolver { tx })
}

#[derive(Default)]
struct ControllerInner {
    observer: Mutex<Option<Observer>>,
    unsubscribed: AtomicBool,
}

/// Drives a [`manual_observable`] source.
#[derive(Clone, Default)]
pub struct ObservableController {
    inner: Arc<ControllerInner>,
}

impl ObservableController {
    fn observer(&self) -> Option<Observer> {
        lock(&self.inner.observer).clone()
    }

    /// Push a value. Ignored before subscription.
    pub fn next(&self, value: Value) {
        if let Some(observer) = self.observer() {
            observer.next(value);
        }
    }

    /// Signal completion.
    pub fn complete(&self) {
        if let Some(observer) = self.observer() {
            observer.complete();
        }
    }

    /// Signal failure.
    pub fn error(&self, error: FetchError) {
        if let Some(observer) = self.observer() {
            observer.error(error);
        }
    }

    /// Whether the engine subscribed.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.observer).is_some()
    }

    /// Whether the engine tore the subscription down.
    #[must_use]
    pub fn is_unsubscribed(&self) -> bool {
        self.inner.unsubscribed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ObservableController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableController")
            .field("subscribed", &self.is_subscribed())
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

/// An observable source pushed by hand through the returned controller.
#[must_use]
pub fn manual_observable() -> (Source, ObservableController) {
    let controller = ObservableController::default();
    let inner = Arc::clone(&controller.inner);

    let source = Source::observable(move |observer| {
        *lock(&inner.observer) = Some(observer);
        Subscription::new(move || inner.unsubscribed.store(true, Ordering::Release))
    });

    (source, controller)
}
