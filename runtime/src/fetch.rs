//! The terminal exchange: running fetch handlers.

use crate::adapter::{self, Disposer, Outlet};
use crate::metrics::FetchMetrics;
use crate::pipeline::{Exchange, ExchangeContext, Next};
use crate::source::{Resumable, Source};
use crate::store::Cache;
use fetchflow_core::{FetchError, Operation, OperationKind, Request, RequestId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What a fetch handler gets to see besides the request.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    cache: Cache,
}

impl HandlerContext {
    /// Context over `cache`.
    #[must_use]
    pub const fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// Read access to stored data.
    #[must_use]
    pub const fn cache(&self) -> &Cache {
        &self.cache
    }
}

/// Produces the source for a request.
///
/// Called synchronously on the engine's dispatch path: do the actual work
/// inside the returned [`Source`], not in `handle` itself. An `Err` becomes
/// a `reject` operation.
pub trait Handler: Send + Sync + 'static {
    /// Start fetching `request`.
    ///
    /// # Errors
    ///
    /// Returns the failure to report when no source can be produced.
    fn handle(&self, request: &Request, cx: &HandlerContext) -> Result<Source, FetchError>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn handle(&self, request: &Request, cx: &HandlerContext) -> Result<Source, FetchError> {
        (**self).handle(request, cx)
    }
}

/// A [`Handler`] written as a closure, see [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Build a [`Handler`] from a closure.
///
/// # Example
///
/// ```
/// use fetchflow_runtime::{handler_fn, Source};
/// use serde_json::json;
///
/// let handler = handler_fn(|request, _cx| {
///     let id = request.id().to_string();
///     Ok(Source::future(async move { Ok(json!({ "id": id })) }))
/// });
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&Request, &HandlerContext) -> Result<Source, FetchError> + Send + Sync + 'static,
{
    HandlerFn { f }
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&Request, &HandlerContext) -> Result<Source, FetchError> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request, cx: &HandlerContext) -> Result<Source, FetchError> {
        (self.f)(request, cx)
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

struct InFlight {
    activation: u64,
    disposer: Disposer,
}

#[derive(Default)]
struct Registry {
    in_flight: HashMap<RequestId, InFlight>,
    parked: HashMap<RequestId, Resumable>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs the handler for `fetch` and stops sources on `cancel`/`dispose`.
///
/// At most one activation per request id is in flight. A `fetch` that
/// arrives while one is running is ignored. Resumable sources (pull
/// callbacks, streams) are parked once an activation settles and picked up
/// again by the next `fetch` for the same id.
pub(crate) struct FetchExchange {
    handler: Arc<dyn Handler>,
    registry: Arc<Mutex<Registry>>,
    next_activation: AtomicU64,
}

impl FetchExchange {
    pub(crate) fn from_arc(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_activation: AtomicU64::new(0),
        }
    }

    fn fetch(&self, op: Operation, cx: &ExchangeContext<'_>) {
        let request = op.request().clone();
        let id = request.id().clone();

        let parked = {
            let mut registry = lock(&self.registry);
            if registry.in_flight.contains_key(&id) {
                tracing::debug!(request = %id, "Activation in flight, ignoring fetch");
                return;
            }
            registry.parked.remove(&id)
        };

        cx.emit(op);

        let source = if let Some(resumable) = parked {
            tracing::debug!(request = %id, "Resuming parked source");
            Source::from(resumable)
        } else {
            FetchMetrics::record_invocation();
            tracing::debug!(request = %id, "Invoking handler");
            match self.handler.handle(&request, &HandlerContext::new(cx.cache())) {
                Ok(source) => source,
                Err(error) => {
                    FetchMetrics::record_handler_error();
                    tracing::warn!(request = %id, %error, "Handler failed");
                    cx.emit(Operation::reject(&request, error));
                    return;
                },
            }
        };

        let activation = self.next_activation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.registry);
        let settled_id = id.clone();
        let outlet = Outlet::new(
            request,
            cx.sink(),
            Arc::new(move |parked| settle(&registry, &settled_id, activation, parked)),
        );

        let disposer = adapter::adapt(source, outlet);
        lock(&self.registry)
            .in_flight
            .insert(id, InFlight { activation, disposer });
    }

    /// Whether `id` has a parked source and nothing in flight, so a `fetch`
    /// would resume it.
    pub(crate) fn is_resumable(&self, id: &RequestId) -> bool {
        let registry = lock(&self.registry);
        !registry.in_flight.contains_key(id) && registry.parked.contains_key(id)
    }

    /// Stop whatever runs or rests for `id`.
    fn stop(&self, id: &RequestId) {
        let (in_flight, parked) = {
            let mut registry = lock(&self.registry);
            (registry.in_flight.remove(id), registry.parked.remove(id))
        };

        if let Some(in_flight) = in_flight {
            FetchMetrics::record_cancelled();
            tracing::debug!(request = %id, activation = in_flight.activation, "Stopping activation");
            in_flight.disposer.dispose();
        }
        if parked.is_some() {
            tracing::debug!(request = %id, "Dropping parked source");
        }
    }
}

/// Release activation `activation` of `id`, parking `parked` if given.
fn settle(registry: &Mutex<Registry>, id: &RequestId, activation: u64, parked: Option<Resumable>) {
    let finished = {
        let mut registry = lock(registry);
        match registry.in_flight.get(id) {
            Some(current) if current.activation == activation => {
                if let Some(parked) = parked {
                    registry.parked.insert(id.clone(), parked);
                }
                registry.in_flight.remove(id)
            },
            _ => None,
        }
    };

    if let Some(finished) = finished {
        tracing::trace!(request = %id, activation, "Activation settled");
        finished.disposer.dispose();
    }
}

impl Exchange for FetchExchange {
    fn name(&self) -> &str {
        "fetch"
    }

    fn handle(&self, op: Operation, cx: &ExchangeContext<'_>, _next: Next<'_>) {
        match op.kind() {
            OperationKind::Fetch => self.fetch(op, cx),
            OperationKind::Cancel | OperationKind::Dispose => {
                self.stop(op.id());
                cx.emit(op);
            },
            _ => cx.emit(op),
        }
    }
}

impl fmt::Debug for FetchExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("FetchExchange")
            .field("in_flight", &registry.in_flight.len())
            .field("parked", &registry.parked.len())
            .finish_non_exhaustive()
    }
}
