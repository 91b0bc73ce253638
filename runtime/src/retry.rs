//! Retry with exponential backoff for one-shot sources.
//!
//! The engine never retries on its own. Wrap a handler in [`Retrying`] to
//! re-run failing future sources, or call [`retry_with_backoff`] inside a
//! handler's future directly.
//!
//! # Example
//!
//! ```rust
//! use fetchflow_runtime::retry::{RetryPolicy, Retrying};
//! use fetchflow_runtime::{handler_fn, Engine, Source};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(5)
//!     .with_initial_delay(Duration::from_millis(100))
//!     .with_max_delay(Duration::from_secs(10));
//!
//! let handler = handler_fn(|_request, _cx| Ok(Source::future(async { Ok(json!(42)) })));
//! let engine = Engine::new(Retrying::new(handler, policy));
//! # drop(engine);
//! # }
//! ```

use crate::fetch::{Handler, HandlerContext};
use crate::metrics::RetryMetrics;
use crate::source::Source;
use fetchflow_core::{FetchError, Request, Value};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy for handling transient failures
///
/// Exponential backoff with jitter:
/// `delay = min(initial_delay * multiplier^attempt, max_delay) * random(0.5..=1.0)`
///
/// Defaults:
/// - `max_attempts`: 3 (including the first one)
/// - `initial_delay`: 100 ms
/// - `max_delay`: 30 seconds
/// - `backoff_multiplier`: 2.0
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Policy with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Set maximum attempts, including the first one
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay before first retry
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between retries
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)]
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff before retry number `retry` (0-based), with jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        use rand::Rng;

        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        self.base_delay(retry).mul_f64(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `operation` until it succeeds or the policy gives up.
///
/// # Errors
///
/// [`FetchError::RetriesExhausted`] wrapping the last failure once
/// `max_attempts` attempts failed.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but only retries errors `is_retryable`
/// accepts. Other errors are returned as they are.
///
/// # Errors
///
/// The first non-retryable error, or [`FetchError::RetriesExhausted`].
pub async fn retry_with_predicate<F, Fut, T, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    P: Fn(&FetchError) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(error) if !is_retryable(&error) => {
                tracing::warn!(%error, "Error is not retryable, failing immediately");
                return Err(error);
            },
            Err(error) if !policy.should_retry(attempt) => {
                RetryMetrics::record_exhausted();
                tracing::error!(attempt, %error, "Operation failed after max attempts");
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            },
            Err(error) => {
                let delay = policy.delay_for_attempt(attempt - 1);
                RetryMetrics::record_attempt();
                tracing::warn!(attempt, delay_ms = delay.as_millis(), %error, "Operation failed, retrying");
                sleep(delay).await;
            },
        }
    }
}

type RetryPredicate = Arc<dyn Fn(&FetchError) -> bool + Send + Sync>;

/// Handler wrapper retrying failed future sources.
///
/// Each retry calls the wrapped handler again for a fresh source. Only
/// [`Source::Future`] sources (and handler errors) are retried; streams,
/// pull callbacks and observables are passed through untouched. Panics are
/// never retried.
pub struct Retrying<H> {
    inner: Arc<H>,
    policy: RetryPolicy,
    retry_if: RetryPredicate,
}

impl<H: Handler> Retrying<H> {
    /// Retry `inner` according to `policy`.
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(inner),
            policy,
            retry_if: Arc::new(|error: &FetchError| !error.is_panic()),
        }
    }

    /// Only retry errors `predicate` accepts.
    #[must_use]
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&FetchError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(move |error: &FetchError| !error.is_panic() && predicate(error));
        self
    }
}

/// One attempt as a future, whatever the handler returned.
fn attempt<H: Handler>(
    inner: &H,
    request: &Request,
    cx: &HandlerContext,
) -> BoxFuture<'static, Result<Value, FetchError>> {
    match inner.handle(request, cx) {
        Ok(Source::Future(future)) => future,
        Ok(Source::Value(value)) => future::ready(Ok(value)).boxed(),
        Ok(other) => future::ready(Err(FetchError::msg(format!(
            "cannot retry a {} source",
            other.kind()
        ))))
        .boxed(),
        Err(error) => future::ready(Err(error)).boxed(),
    }
}

impl<H: Handler> Handler for Retrying<H> {
    fn handle(&self, request: &Request, cx: &HandlerContext) -> Result<Source, FetchError> {
        let first = match self.inner.handle(request, cx) {
            Ok(Source::Future(future)) => future,
            Err(error) if (self.retry_if)(&error) => future::ready(Err(error)).boxed(),
            other => return other,
        };

        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        let cx = cx.clone();
        let policy = self.policy.clone();
        let retry_if = Arc::clone(&self.retry_if);
        let mut first = Some(first);

        Ok(Source::future(async move {
            retry_with_predicate(
                &policy,
                || first.take().unwrap_or_else(|| attempt(&*inner, &request, &cx)),
                |error| retry_if(error),
            )
            .await
        }))
    }
}

impl<H> fmt::Debug for Retrying<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrying")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
