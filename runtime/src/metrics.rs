//! Prometheus metrics for the fetch engine.
//!
//! The engine records through the `metrics` facade at all times; nothing is
//! exported until a recorder is installed, for example by starting a
//! [`MetricsServer`]:
//! - Operations committed to the store, by kind
//! - Operations dropped by the dedup gate
//! - Handler invocations and cancelled activations
//! - Inactivity disposals and live records
//! - Source step latency
//! - Retries of the retrying handler
//!
//! # Example
//!
//! ```rust,no_run
//! use fetchflow_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use fetchflow_core::{OperationKind, State};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Operations committed to the store (label `kind`).
pub const OPERATIONS_TOTAL: &str = "fetchflow_operations_total";
/// Operations dropped by the dedup gate (label `kind`).
pub const OPERATIONS_DEDUPLICATED: &str = "fetchflow_operations_deduplicated_total";
/// Fetch handler invocations.
pub const HANDLER_INVOCATIONS: &str = "fetchflow_handler_invocations_total";
/// Fetch handler invocations that failed synchronously.
pub const HANDLER_ERRORS: &str = "fetchflow_handler_errors_total";
/// In-flight activations stopped by `cancel` or `dispose`.
pub const ACTIVATIONS_CANCELLED: &str = "fetchflow_activations_cancelled_total";
/// Requests disposed by the inactivity collector.
pub const COLLECTOR_DISPOSALS: &str = "fetchflow_collector_disposals_total";
/// Records currently held by the store.
pub const STORE_RECORDS: &str = "fetchflow_store_records";
/// Time spent awaiting one source step (label `kind`).
pub const SOURCE_DURATION: &str = "fetchflow_source_duration_seconds";
/// Retries started by the retrying handler.
pub const RETRY_ATTEMPTS: &str = "fetchflow_retry_attempts_total";
/// Retrying handler give-ups.
pub const RETRY_EXHAUSTED: &str = "fetchflow_retry_exhausted_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the engine's metrics.
///
/// Holds the handle used to render the current values in the Prometheus
/// text format; serving them over HTTP is up to the application.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the histogram buckets are rejected
    /// and [`MetricsError::Install`] if a different recorder is installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Address the metrics should be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The Prometheus handle, once started.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Operations committed to the store");
    describe_counter!(OPERATIONS_DEDUPLICATED, "Operations dropped by the dedup gate");
    describe_counter!(HANDLER_INVOCATIONS, "Fetch handler invocations");
    describe_counter!(HANDLER_ERRORS, "Fetch handler invocations that failed synchronously");
    describe_counter!(ACTIVATIONS_CANCELLED, "In-flight source activations that were stopped");
    describe_counter!(COLLECTOR_DISPOSALS, "Requests disposed after staying unobserved");
    describe_gauge!(STORE_RECORDS, "Records currently held by the store");
    describe_histogram!(SOURCE_DURATION, "Time spent awaiting one source step");
    describe_counter!(RETRY_ATTEMPTS, "Retries started by the retrying handler");
    describe_counter!(RETRY_EXHAUSTED, "Requests the retrying handler gave up on");
}

/// Engine metrics recorder.
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record an operation committed to the store.
    pub fn record_commit(kind: OperationKind, state: State, records: usize) {
        counter!(OPERATIONS_TOTAL, "kind" => kind.as_str(), "state" => state.as_str()).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(STORE_RECORDS).set(records as f64);
    }

    /// Record an operation dropped by the dedup gate.
    pub fn record_dedup(kind: OperationKind) {
        counter!(OPERATIONS_DEDUPLICATED, "kind" => kind.as_str()).increment(1);
    }

    /// Record a disposal issued by the inactivity collector.
    pub fn record_collected() {
        counter!(COLLECTOR_DISPOSALS).increment(1);
    }
}

/// Fetch exchange metrics recorder.
pub struct FetchMetrics;

impl FetchMetrics {
    /// Record a handler invocation.
    pub fn record_invocation() {
        counter!(HANDLER_INVOCATIONS).increment(1);
    }

    /// Record a handler that returned an error instead of a source.
    pub fn record_handler_error() {
        counter!(HANDLER_ERRORS).increment(1);
    }

    /// Record an activation stopped before it settled.
    pub fn record_cancelled() {
        counter!(ACTIVATIONS_CANCELLED).increment(1);
    }

    /// Record how long one source step took.
    pub fn record_step(kind: &'static str, duration: Duration) {
        histogram!(SOURCE_DURATION, "kind" => kind).record(duration.as_secs_f64());
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!(RETRY_ATTEMPTS).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!(RETRY_EXHAUSTED).increment(1);
    }
}
