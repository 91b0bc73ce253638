//! The engine: dedup gate, dispatch queue, store updates and the public
//! fetch surface.
//!
//! All state changes run as jobs on a single queue. Whoever enqueues into an
//! idle queue drains it on their own thread until it is empty; everyone else
//! only pushes. That gives run-to-completion per operation without a
//! dedicated thread: a subscriber calling `fetch_more` from inside its
//! callback just queues the fetch behind the operation being delivered.

use crate::collector::InactivityCollector;
use crate::config::EngineConfig;
use crate::emitter::{Emitter, Listener, ListenerId};
use crate::error::EngineError;
use crate::fetch::{FetchExchange, Handler};
use crate::metrics::EngineMetrics;
use crate::pipeline::{Exchange, ExchangeContext, Pipeline};
use crate::store::{Cache, Store};
use fetchflow_core::{
    is_redundant, FetchError, Operation, OperationKind, Request, RequestId, RequestRecord, State,
    Value,
};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// Unit of work on the dispatch queue.
pub(crate) type Job = Box<dyn FnOnce(&Shared) + Send>;

/// Subscriber callback: `(state, data, error)`.
///
/// `error` is only set for the `reject` that moved the request to
/// [`State::Failed`].
pub type Subscriber = Arc<dyn Fn(State, Option<&Value>, Option<&FetchError>) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the emitter hands to listeners for every committed operation.
#[derive(Clone, Debug)]
pub(crate) struct Notification {
    operation: Operation,
    state: State,
    data: Option<Value>,
}

#[derive(Default)]
struct DispatchQueue {
    jobs: VecDeque<Job>,
    draining: bool,
}

/// Resets the draining flag if a job unwinds, so the next caller drains.
struct DrainGuard<'a> {
    queue: &'a Mutex<DispatchQueue>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.queue).draining = false;
        }
    }
}

/// Everything the engine owns, shared by handles, sinks and jobs.
pub(crate) struct Shared {
    config: EngineConfig,
    store: Store,
    emitter: Emitter<Notification>,
    pipeline: Pipeline,
    fetcher: Arc<FetchExchange>,
    collector: InactivityCollector,
    prefetched: Mutex<HashSet<RequestId>>,
    queue: Mutex<DispatchQueue>,
    operations: broadcast::Sender<Operation>,
    sink: Sink,
}

impl Shared {
    pub(crate) const fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn sink(&self) -> Sink {
        self.sink.clone()
    }

    /// Queue `job`, draining the queue if nobody else is.
    fn enqueue(&self, job: Job) {
        {
            let mut queue = lock(&self.queue);
            queue.jobs.push_back(job);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        let mut guard = DrainGuard {
            queue: &self.queue,
            armed: true,
        };
        loop {
            let job = {
                let mut queue = lock(&self.queue);
                if let Some(job) = queue.jobs.pop_front() {
                    job
                } else {
                    queue.draining = false;
                    guard.armed = false;
                    return;
                }
            };
            job(self);
        }
    }

    /// Dedup gate, then the pipeline.
    ///
    /// A `fetch` for a request whose source is parked always passes: a pull
    /// that came back empty leaves the request where it was, `pending`
    /// included, and only a fetch can resume it.
    fn apply(&self, op: Operation) {
        let current = self.store.state(op.id());
        if is_redundant(current, &op) && !self.resumes_parked(&op) {
            EngineMetrics::record_dedup(op.kind());
            tracing::debug!(request = %op.id(), kind = %op.kind(), state = ?current, "Dropping no-op operation");
            return;
        }

        self.pipeline.run(op, &ExchangeContext::new(self));
    }

    fn resumes_parked(&self, op: &Operation) -> bool {
        op.kind() == OperationKind::Fetch && self.fetcher.is_resumable(op.id())
    }

    /// Whether a fetch would get more out of `id` right now.
    fn has_more(&self, id: &RequestId) -> bool {
        self.store.state(id) == Some(State::Ready) || self.fetcher.is_resumable(id)
    }

    /// Deliver the current record of a prefetched request to a new
    /// subscriber, or fetch it again if it is gone.
    fn deliver_prefetched(&self, request: &Request, subscriber: &Subscriber, primed: &AtomicBool) {
        primed.store(true, Ordering::Release);
        if let Some(record) = self.store.get(request.id()) {
            tracing::debug!(request = %request.id(), state = %record.state, "Delivering prefetched result");
            subscriber(record.state, record.data.as_ref(), None);
        } else {
            self.apply(Operation::fetch(request));
        }
    }

    /// Commit `op` to the store and notify.
    pub(crate) fn update(&self, op: Operation) {
        let Some(snapshot) = self.store.commit(&op) else {
            tracing::trace!(%op, "No record to update, dropping operation");
            return;
        };

        if snapshot.state == State::Disposed {
            lock(&self.prefetched).remove(op.id());
        }

        EngineMetrics::record_commit(op.kind(), snapshot.state, self.store.len());
        tracing::trace!(%op, state = %snapshot.state, "Committed");

        // No receivers is fine.
        let _ = self.operations.send(op.clone());

        let id = op.id().clone();
        self.emitter.emit(
            &id,
            &Notification {
                operation: op,
                state: snapshot.state,
                data: snapshot.data,
            },
        );
    }

    /// Arm the inactivity timer of `request`.
    fn schedule_disposal(&self, request: &Request) {
        let sink = self.sink();
        let request = request.clone();
        let id = request.id().clone();

        self.collector.schedule(&id, move |token| {
            sink.schedule(Box::new(move |shared| {
                if shared.collector.expire(request.id(), token) {
                    EngineMetrics::record_collected();
                    tracing::debug!(request = %request.id(), "Disposing inactive request");
                    shared.apply(Operation::dispose(&request));
                }
            }));
        });
    }
}

/// Handle for publishing operations from outside the dispatch path.
///
/// Holds the engine weakly: once every [`Engine`] clone and
/// [`FetchHandle`] is gone, sends are silently dropped.
#[derive(Clone)]
pub struct Sink {
    shared: Weak<Shared>,
}

impl Sink {
    /// Commit `op` to the store and notify subscribers, bypassing the dedup
    /// gate and the pipeline.
    pub fn emit(&self, op: Operation) {
        self.schedule(Box::new(move |shared| shared.update(op)));
    }

    /// Run `op` through the dedup gate and the pipeline.
    pub fn dispatch(&self, op: Operation) {
        self.schedule(Box::new(move |shared| shared.apply(op)));
    }

    pub(crate) fn schedule(&self, job: Job) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enqueue(job);
        } else {
            tracing::trace!("Engine dropped, discarding job");
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// The fetch engine.
///
/// Cheap to clone; clones share one store. Must be used inside a Tokio
/// runtime: sources and inactivity timers run on Tokio tasks.
///
/// # Example
///
/// ```
/// use fetchflow_core::{Request, State};
/// use fetchflow_runtime::{handler_fn, Engine, Source};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = Engine::new(handler_fn(|_request, _cx| {
///     Ok(Source::future(async { Ok(json!({ "id": 1, "name": "Dan" })) }))
/// }));
///
/// let request = Request::new("user-1", json!({ "url": "/users/1" }));
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
/// let _handle = engine.subscribe(&request, move |state, data, _error| {
///     let _ = tx.send((state, data.cloned()));
/// });
///
/// assert_eq!(rx.recv().await, Some((State::Pending, None)));
/// assert_eq!(
///     rx.recv().await,
///     Some((State::Completed, Some(json!({ "id": 1, "name": "Dan" }))))
/// );
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Engine with default configuration and no extra exchanges.
    pub fn new(handler: impl Handler) -> Self {
        Self::builder(handler).build()
    }

    /// Start configuring an engine.
    pub fn builder(handler: impl Handler) -> EngineBuilder {
        EngineBuilder {
            handler: Arc::new(handler),
            exchanges: Vec::new(),
            config: EngineConfig::default(),
        }
    }

    /// Fetch `request` without watching it.
    ///
    /// The request counts as unobserved from the start: it is disposed after
    /// `max_age` unless a subscriber attaches first.
    #[tracing::instrument(skip_all, fields(request = %request.id()))]
    pub fn fetch(&self, request: &Request) -> FetchHandle {
        self.start(request, None)
    }

    /// Fetch `request` and call `subscriber` for every operation on it.
    ///
    /// If the request was prefetched, `subscriber` is called right away with
    /// the prefetched state and data instead of fetching again.
    #[tracing::instrument(skip_all, fields(request = %request.id()))]
    pub fn subscribe<F>(&self, request: &Request, subscriber: F) -> FetchHandle
    where
        F: Fn(State, Option<&Value>, Option<&FetchError>) + Send + Sync + 'static,
    {
        self.start(request, Some(Arc::new(subscriber)))
    }

    /// Fetch `request` ahead of time, once.
    ///
    /// Does nothing if it is already prefetched. The next subscriber
    /// receives the result without a second fetch.
    #[tracing::instrument(skip_all, fields(request = %request.id()))]
    pub fn prefetch(&self, request: &Request) {
        if lock(&self.shared.prefetched).contains(request.id()) {
            tracing::debug!("Already prefetched");
            return;
        }

        let _handle = self.fetch(request);
        lock(&self.shared.prefetched).insert(request.id().clone());
    }

    /// Run any operation through the dedup gate and the pipeline.
    #[tracing::instrument(skip_all, fields(request = %op.id(), kind = %op.kind()))]
    pub fn dispatch(&self, op: Operation) {
        self.shared.enqueue(Box::new(move |shared| shared.apply(op)));
    }

    fn start(&self, request: &Request, subscriber: Option<Subscriber>) -> FetchHandle {
        let shared = &self.shared;
        let id = request.id();

        // A prefetched subscriber hears nothing until its snapshot is out.
        let prefetched = subscriber.is_some() && lock(&shared.prefetched).remove(id);
        let primed = Arc::new(AtomicBool::new(!prefetched));

        let listener = subscriber.as_ref().map(|subscriber| {
            shared.collector.keep(id);
            let subscriber = Arc::clone(subscriber);
            let primed = Arc::clone(&primed);
            let listener: Listener<Notification> = Arc::new(move |n: &Notification| {
                if !primed.load(Ordering::Acquire) {
                    return;
                }
                let error = match n.operation.kind() {
                    OperationKind::Reject => n.operation.error(),
                    _ => None,
                };
                subscriber(n.state, n.data.as_ref(), error);
            });
            shared.emitter.on(id, listener)
        });

        if subscriber.is_none() && !shared.emitter.has_subscribers(id) {
            shared.schedule_disposal(request);
        }

        match subscriber {
            Some(subscriber) if prefetched => {
                let request = request.clone();
                shared.enqueue(Box::new(move |shared| {
                    shared.deliver_prefetched(&request, &subscriber, &primed);
                }));
            },
            _ => {
                let op = Operation::fetch(request);
                shared.enqueue(Box::new(move |shared| shared.apply(op)));
            },
        }

        FetchHandle {
            shared: Arc::clone(shared),
            request: request.clone(),
            listener,
        }
    }

    /// Current state of `id`, `None` when unknown.
    #[must_use]
    pub fn state(&self, id: &RequestId) -> Option<State> {
        self.shared.store.state(id)
    }

    /// Latest data of `id`.
    #[must_use]
    pub fn data(&self, id: &RequestId) -> Option<Value> {
        self.shared.store.get(id).and_then(|record| record.data)
    }

    /// Copy of the record of `id`.
    #[must_use]
    pub fn record(&self, id: &RequestId) -> Option<RequestRecord> {
        self.shared.store.get(id)
    }

    /// Read-only view over all stored data.
    #[must_use]
    pub fn cache(&self) -> Cache {
        self.shared.store.cache()
    }

    /// Whether `id` has at least one subscriber.
    #[must_use]
    pub fn has_subscribers(&self, id: &RequestId) -> bool {
        self.shared.emitter.has_subscribers(id)
    }

    /// Whether a disposal is pending for `id`.
    #[must_use]
    pub fn is_disposal_scheduled(&self, id: &RequestId) -> bool {
        self.shared.collector.is_scheduled(id)
    }

    /// Receive every operation committed to the store, in commit order.
    #[must_use]
    pub fn subscribe_operations(&self) -> broadcast::Receiver<Operation> {
        self.shared.operations.subscribe()
    }

    /// Handle for emitting from tasks the engine does not own.
    #[must_use]
    pub fn sink(&self) -> Sink {
        self.shared.sink()
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("pipeline", &self.shared.pipeline)
            .field("records", &self.shared.store.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    handler: Arc<dyn Handler>,
    exchanges: Vec<Arc<dyn Exchange>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Append an exchange. Exchanges run in the order they are added, all
    /// before the fetch exchange.
    #[must_use]
    pub fn exchange(mut self, exchange: impl Exchange) -> Self {
        self.exchanges.push(Arc::new(exchange));
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the inactivity window.
    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.config = self.config.with_max_age(max_age);
        self
    }

    /// Build the engine.
    #[must_use]
    pub fn build(self) -> Engine {
        let Self {
            handler,
            exchanges,
            config,
        } = self;

        let fetcher = Arc::new(FetchExchange::from_arc(handler));
        let pipeline = Pipeline::new(exchanges, Arc::clone(&fetcher) as Arc<dyn Exchange>);
        let (operations, _) = broadcast::channel(config.operation_broadcast_capacity.max(1));
        tracing::debug!(?pipeline, max_age = ?config.max_age, "Building engine");

        let shared = Arc::new_cyclic(|weak| Shared {
            store: Store::new(),
            emitter: Emitter::new(),
            pipeline,
            fetcher,
            collector: InactivityCollector::new(config.max_age),
            prefetched: Mutex::new(HashSet::new()),
            queue: Mutex::new(DispatchQueue::default()),
            operations,
            sink: Sink {
                shared: Weak::clone(weak),
            },
            config,
        });

        Engine { shared }
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("exchanges", &self.exchanges.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Returned by [`Engine::fetch`] and [`Engine::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe).
pub struct FetchHandle {
    shared: Arc<Shared>,
    request: Request,
    listener: Option<ListenerId>,
}

impl FetchHandle {
    /// The request this handle is about.
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    /// Abort the request if it is pending or streaming.
    pub fn cancel(&self) {
        let op = Operation::cancel(&self.request);
        self.shared.enqueue(Box::new(move |shared| shared.apply(op)));
    }

    /// Whether the source rests and can deliver more: the request is
    /// `ready`, or a pull callback is parked between cycles.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.shared.has_more(self.request.id())
    }

    /// Ask a resting source for its next value.
    ///
    /// Pull callbacks deliver eagerly, so their requests sit in `buffering`
    /// (or still `pending` after an empty first pull) between cycles; this
    /// resumes them all the same.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NothingMoreToFetch`] when [`has_more`](Self::has_more)
    /// is false; nothing is dispatched then.
    pub fn fetch_more(&self) -> Result<(), EngineError> {
        if !self.has_more() {
            let state = self.state();
            return Err(EngineError::NothingMoreToFetch {
                request: self.request.id().clone(),
                state,
            });
        }

        let op = Operation::fetch(&self.request);
        self.shared.enqueue(Box::new(move |shared| shared.apply(op)));
        Ok(())
    }

    /// Stop watching the request.
    ///
    /// When this was the last subscriber, the request is cancelled and its
    /// disposal scheduled.
    pub fn unsubscribe(&mut self) {
        let id = self.request.id();
        if let Some(listener) = self.listener.take() {
            self.shared.emitter.off(id, listener);
        }

        if !self.shared.emitter.has_subscribers(id) {
            self.cancel();
            self.shared.schedule_disposal(&self.request);
        }
    }

    /// Whether this handle still has a subscriber registered.
    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.listener.is_some()
    }

    /// Current state of the request.
    #[must_use]
    pub fn state(&self) -> Option<State> {
        self.shared.store.state(self.request.id())
    }

    /// Latest data of the request.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        self.shared
            .store
            .get(self.request.id())
            .and_then(|record| record.data)
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("request", self.request.id())
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}
