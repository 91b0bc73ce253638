//! # Fetchflow Runtime
//!
//! The engine that drives requests through their lifecycle.
//!
//! ## Core Components
//!
//! - **Engine**: dedup gate, dispatch queue and the public fetch surface
//! - **Exchanges**: middleware chain every operation passes through, ending
//!   in the fetch exchange that runs handlers
//! - **Sources**: what handlers return (value, future, observable, pull
//!   callback, stream) and how each becomes operations
//! - **Store / Emitter**: per-request records and per-request subscribers
//! - **Inactivity collector**: disposes requests nobody watches any more
//!
//! ## Example
//!
//! ```
//! use fetchflow_core::{Request, State};
//! use fetchflow_runtime::{handler_fn, Engine, EngineConfig, Source, TracingExchange};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = Engine::builder(handler_fn(|_request, _cx| {
//!     // One chunk per fetch; `fetch_more` pulls the next.
//!     Ok(Source::iter([Ok(json!([1, 2])), Ok(json!([3]))]))
//! }))
//! .exchange(TracingExchange)
//! .config(EngineConfig::default().with_max_age(Duration::from_secs(60)))
//! .build();
//!
//! let request = Request::new("feed", json!({ "page_size": 2 }));
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let handle = engine.subscribe(&request, move |state, _data, _error| {
//!     let _ = tx.send(state);
//! });
//!
//! assert_eq!(rx.recv().await, Some(State::Pending));
//! assert_eq!(rx.recv().await, Some(State::Ready));
//! assert!(handle.has_more());
//!
//! handle.fetch_more().unwrap();
//! assert_eq!(rx.recv().await, Some(State::Buffering));
//! assert_eq!(rx.recv().await, Some(State::Ready));
//! # }
//! ```

/// Turning sources into operations
mod adapter;

/// Inactivity collector
pub mod collector;

/// Engine configuration
pub mod config;

/// Per-request listener lists
pub mod emitter;

/// Engine, fetch handles and the dispatch queue
pub mod engine;

/// Fetch exchange and the handler contract
pub mod fetch;

/// Prometheus metrics for observability
pub mod metrics;

/// Exchange pipeline
pub mod pipeline;

/// Retry with exponential backoff
pub mod retry;

/// Handler return values
pub mod source;

/// Request store and cache
pub mod store;

/// Error types for the engine
pub mod error {
    use fetchflow_core::{RequestId, State};
    use thiserror::Error;

    /// Usage errors reported synchronously to the caller.
    ///
    /// These are never turned into operations: the request's state is left
    /// as it was.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum EngineError {
        /// `fetch_more` was called while the request was not `ready`
        #[error("Nothing more to fetch for request {request} (state: {state:?})")]
        NothingMoreToFetch {
            /// The request
            request: RequestId,
            /// Its state at the time of the call
            state: Option<State>,
        },
    }
}

pub use collector::InactivityCollector;
pub use config::EngineConfig;
pub use emitter::{Emitter, ListenerId};
pub use engine::{Engine, EngineBuilder, FetchHandle, Sink, Subscriber};
pub use error::EngineError;
pub use fetch::{handler_fn, Handler, HandlerContext, HandlerFn};
pub use pipeline::{exchange_fn, Exchange, ExchangeContext, ExchangeFn, Next, TracingExchange};
pub use source::{Observable, Observer, PullFn, Source, SourceKind, Subscription};
pub use store::{Cache, Snapshot, Store};
