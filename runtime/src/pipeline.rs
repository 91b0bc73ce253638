//! Exchanges - the middleware chain every operation goes through.
//!
//! User exchanges run left to right, in the order given to the
//! [`EngineBuilder`](crate::EngineBuilder); the fetch exchange always comes
//! last. An exchange may forward an operation with [`Next::run`], replace
//! it, swallow it, or publish extra operations with
//! [`ExchangeContext::emit`] (now) or a [`Sink`] (later, from a task).
//!
//! Exchanges run on the engine's dispatch path and must not block. A
//! panicking exchange is not caught.

use crate::engine::{Shared, Sink};
use crate::store::Cache;
use fetchflow_core::{Operation, RequestId, State};
use std::fmt;
use std::sync::Arc;

/// One pipeline stage.
pub trait Exchange: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Process `op`. Call `next.run(op)` to pass it on.
    fn handle(&self, op: Operation, cx: &ExchangeContext<'_>, next: Next<'_>);
}

/// An [`Exchange`] written as a closure, see [`exchange_fn`].
#[derive(Clone)]
pub struct ExchangeFn<F> {
    name: &'static str,
    f: F,
}

/// Build an [`Exchange`] from a closure.
///
/// # Example
///
/// ```
/// use fetchflow_core::OperationKind;
/// use fetchflow_runtime::exchange_fn;
///
/// // Drop every cancel before it reaches the fetch exchange.
/// let ignore_cancel = exchange_fn("ignore-cancel", |op, _cx, next| {
///     if op.kind() != OperationKind::Cancel {
///         next.run(op);
///     }
/// });
/// ```
pub fn exchange_fn<F>(name: &'static str, f: F) -> ExchangeFn<F>
where
    F: Fn(Operation, &ExchangeContext<'_>, Next<'_>) + Send + Sync + 'static,
{
    ExchangeFn { name, f }
}

impl<F> Exchange for ExchangeFn<F>
where
    F: Fn(Operation, &ExchangeContext<'_>, Next<'_>) + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    fn handle(&self, op: Operation, cx: &ExchangeContext<'_>, next: Next<'_>) {
        (self.f)(op, cx, next);
    }
}

impl<F> fmt::Debug for ExchangeFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeFn").field("name", &self.name).finish()
    }
}

/// What an exchange can do besides forwarding.
pub struct ExchangeContext<'a> {
    shared: &'a Shared,
}

impl<'a> ExchangeContext<'a> {
    pub(crate) const fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    /// Commit `op` to the store and notify subscribers, right now.
    ///
    /// Bypasses the dedup gate and the rest of the pipeline.
    pub fn emit(&self, op: Operation) {
        self.shared.update(op);
    }

    /// Read access to stored data.
    #[must_use]
    pub fn cache(&self) -> Cache {
        self.shared.store().cache()
    }

    /// Current state of a request.
    #[must_use]
    pub fn state(&self, id: &RequestId) -> Option<State> {
        self.shared.store().state(id)
    }

    /// Handle for emitting operations after this call returns.
    #[must_use]
    pub fn sink(&self) -> Sink {
        self.shared.sink()
    }
}

impl fmt::Debug for ExchangeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeContext").finish_non_exhaustive()
    }
}

/// The rest of the pipeline after the current exchange.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Exchange>],
    cx: &'a ExchangeContext<'a>,
}

impl Next<'_> {
    /// Hand `op` to the following exchange.
    pub fn run(&self, op: Operation) {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                tracing::trace!(exchange = stage.name(), %op, "Entering exchange");
                stage.handle(
                    op,
                    self.cx,
                    Next {
                        stages: rest,
                        cx: self.cx,
                    },
                );
            },
            None => tracing::trace!(%op, "Operation left the pipeline"),
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.stages.len())
            .finish()
    }
}

/// Exchanges composed into one callable, terminal exchange last.
pub(crate) struct Pipeline {
    stages: Vec<Arc<dyn Exchange>>,
}

impl Pipeline {
    pub(crate) fn new(mut exchanges: Vec<Arc<dyn Exchange>>, terminal: Arc<dyn Exchange>) -> Self {
        exchanges.push(terminal);
        Self { stages: exchanges }
    }

    pub(crate) fn run(&self, op: Operation, cx: &ExchangeContext<'_>) {
        Next {
            stages: &self.stages,
            cx,
        }
        .run(op);
    }

    pub(crate) fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Pass-through exchange logging every operation that enters the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingExchange;

impl Exchange for TracingExchange {
    fn name(&self) -> &str {
        "tracing"
    }

    fn handle(&self, op: Operation, cx: &ExchangeContext<'_>, next: Next<'_>) {
        tracing::debug!(
            request = %op.id(),
            kind = %op.kind(),
            state = ?cx.state(op.id()),
            lazy = op.is_lazy(),
            "Operation"
        );
        next.run(op);
    }
}
