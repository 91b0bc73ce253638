//! What a fetch handler returns.
//!
//! A handler hands back a [`Source`]: one tagged value per producer shape.
//! The fetch exchange adapts it into `put`/`complete`/`reject` operations:
//!
//! | source | operations |
//! |---|---|
//! | [`Source::Value`] | `complete(value)` |
//! | [`Source::Future`] | `complete(value)` or `reject(error)` once it resolves |
//! | [`Source::Observable`] | `put(value, eager)` per pushed value, then `complete()` / `reject(error)` |
//! | [`Source::Pull`] | one call per fetch: `put(value, eager)`, nothing for `None`, `reject(error)` |
//! | [`Source::Stream`] | one item per fetch: `put(value, lazy)`, `complete()` when exhausted, `reject(error)` |
//!
//! Pull callbacks and streams survive between fetches: the fetch exchange
//! keeps them parked and resumes them on "fetch more" instead of calling the
//! handler again.

use crate::adapter::Outlet;
use fetchflow_core::{FetchError, Value};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A callback producing successive values, one per invocation.
///
/// `Ok(None)` means "nothing right now": the current pull ends without
/// completing, and the callback is invoked again on the next fetch.
pub type PullFn = Box<dyn FnMut() -> BoxFuture<'static, Result<Option<Value>, FetchError>> + Send>;

/// The producer returned by a fetch handler.
pub enum Source {
    /// Already available value
    Value(Value),
    /// One-shot asynchronous value
    Future(BoxFuture<'static, Result<Value, FetchError>>),
    /// Push-based producer
    Observable(Box<dyn Observable>),
    /// Pull callback, resumed once per fetch
    Pull(PullFn),
    /// Lazily pulled stream (async generator), one item per fetch
    Stream(BoxStream<'static, Result<Value, FetchError>>),
}

/// Discriminant of a [`Source`], for logs and metric labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// [`Source::Value`]
    Value,
    /// [`Source::Future`]
    Future,
    /// [`Source::Observable`]
    Observable,
    /// [`Source::Pull`]
    Pull,
    /// [`Source::Stream`]
    Stream,
}

impl SourceKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Future => "future",
            Self::Observable => "observable",
            Self::Pull => "pull",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Source {
    /// A value that is already there.
    #[must_use]
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// A future resolving to the value.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self::Future(future.boxed())
    }

    /// A future using `anyhow` for its errors.
    ///
    /// The error chain is flattened into a [`FetchError::Message`].
    pub fn try_future<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::future(future.map(|result| result.map_err(|e| FetchError::msg(format!("{e:#}")))))
    }

    /// An observable written as a closure.
    ///
    /// The closure receives the [`Observer`] to push into and returns the
    /// [`Subscription`] that tears the producer down.
    pub fn observable<F>(subscribe: F) -> Self
    where
        F: FnOnce(Observer) -> Subscription + Send + 'static,
    {
        Self::Observable(Box::new(subscribe))
    }

    /// Any [`Observable`] implementation.
    pub fn from_observable<O: Observable>(observable: O) -> Self {
        Self::Observable(Box::new(observable))
    }

    /// A pull callback.
    pub fn pull<F, Fut>(mut pull: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>, FetchError>> + Send + 'static,
    {
        Self::Pull(Box::new(move || pull().boxed()))
    }

    /// A lazily pulled stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, FetchError>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// A lazily pulled stream over the items of an iterator.
    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Result<Value, FetchError>>,
        I::IntoIter: Send + 'static,
    {
        Self::stream(futures::stream::iter(items))
    }

    /// Which kind of source this is.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        match self {
            Self::Value(_) => SourceKind::Value,
            Self::Future(_) => SourceKind::Future,
            Self::Observable(_) => SourceKind::Observable,
            Self::Pull(_) => SourceKind::Pull,
            Self::Stream(_) => SourceKind::Stream,
        }
    }
}

impl From<Value> for Source {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            other => write!(f, "{}(<opaque>)", other.kind()),
        }
    }
}

/// A source parked between two fetches.
pub(crate) enum Resumable {
    Pull(PullFn),
    Stream(BoxStream<'static, Result<Value, FetchError>>),
}

impl From<Resumable> for Source {
    fn from(resumable: Resumable) -> Self {
        match resumable {
            Resumable::Pull(pull) => Self::Pull(pull),
            Resumable::Stream(stream) => Self::Stream(stream),
        }
    }
}

/// A push-based producer.
///
/// Closures `FnOnce(Observer) -> Subscription` implement this trait; see
/// [`Source::observable`].
pub trait Observable: Send + 'static {
    /// Start producing into `observer`.
    ///
    /// The returned subscription is torn down when the request is cancelled
    /// or disposed, and after the observable signalled completion or error.
    fn subscribe(self: Box<Self>, observer: Observer) -> Subscription;
}

impl<F> Observable for F
where
    F: FnOnce(Observer) -> Subscription + Send + 'static,
{
    fn subscribe(self: Box<Self>, observer: Observer) -> Subscription {
        (*self)(observer)
    }
}

/// Teardown logic of an [`Observable`].
#[must_use = "dropping a Subscription does not unsubscribe"]
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Run `teardown` on unsubscribe.
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Nothing to tear down.
    pub const fn empty() -> Self {
        Self { teardown: None }
    }

    /// Run the teardown.
    pub fn unsubscribe(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("armed", &self.teardown.is_some())
            .finish()
    }
}

/// Where an [`Observable`] pushes its values.
///
/// Cheap to clone and safe to move to other threads or tasks. After
/// `complete`, `error`, or cancellation of the request every call is
/// ignored.
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    outlet: Outlet,
    closed: AtomicBool,
}

impl Observer {
    pub(crate) fn new(outlet: Outlet) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                outlet,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Push a value (`put` with eager meta).
    pub fn next(&self, value: Value) {
        if self.is_closed() {
            return;
        }
        self.inner.outlet.put(value, false);
    }

    /// Signal failure. Closes the observer.
    pub fn error(&self, error: FetchError) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.outlet.reject(error);
    }

    /// Signal completion. Closes the observer.
    pub fn complete(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.outlet.complete(None);
    }

    /// Whether further calls will be ignored.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || !self.inner.outlet.is_live()
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("request", self.inner.outlet.request().id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
