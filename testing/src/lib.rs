//! # Fetchflow Testing
//!
//! Testing utilities and helpers for fetchflow engines.
//!
//! This crate provides:
//! - [`TransitionTest`], a Given-When-Then builder over the state machine
//! - [`SnapshotLog`] and [`OperationLog`], recording a subscriber's
//!   deliveries and the operations entering the exchange chain
//! - [`ScriptedHandler`], [`deferred`] and [`manual_observable`], handlers
//!   and sources driven from the test body
//! - proptest strategies for states and operations
//!
//! ## Example
//!
//! ```
//! use fetchflow_core::{Request, State};
//! use fetchflow_runtime::Engine;
//! use fetchflow_testing::{deferred, ScriptedHandler, SnapshotLog};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (source, resolver) = deferred();
//! let handler = ScriptedHandler::new();
//! handler.then(source);
//!
//! let engine = Engine::new(handler.clone());
//! let log = SnapshotLog::new();
//! let _handle = engine.subscribe(&Request::from_id("user"), log.subscriber());
//!
//! log.wait_for_state(State::Pending).await;
//! resolver.resolve(json!({ "name": "Ada" }));
//!
//! let done = log.wait_for_state(State::Completed).await;
//! assert_eq!(done.data, Some(json!({ "name": "Ada" })));
//! assert_eq!(handler.invocations(), 1);
//! # }
//! ```

pub mod mocks;
pub mod recorders;

/// Test helpers and utilities
pub mod helpers {
    use fetchflow_core::Operation;
    use tokio::sync::broadcast::{self, error::TryRecvError};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    /// Install a `fmt` subscriber honouring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "fetchflow=debug".into()))
            .with(tracing_subscriber::fmt::layer().with_test_writer().with_target(false))
            .try_init();
    }

    /// Everything currently buffered in an operation receiver.
    ///
    /// Lagged receivers skip what they missed.
    pub fn drain(rx: &mut broadcast::Receiver<Operation>) -> Vec<Operation> {
        let mut ops = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(op) => ops.push(op),
                Err(TryRecvError::Lagged(_)) => {},
                Err(TryRecvError::Empty | TryRecvError::Closed) => return ops,
            }
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use fetchflow_core::{FetchError, Meta, Operation, Request, State};
    use proptest::prelude::*;
    use serde_json::json;

    /// Any state, or none.
    pub fn arb_state() -> impl Strategy<Value = Option<State>> {
        proptest::option::of(proptest::sample::select(State::ALL.to_vec()))
    }

    /// Any operation on `request`, with small payloads.
    pub fn arb_operation(request: Request) -> impl Strategy<Value = Operation> {
        (0..8u8, any::<i32>()).prop_map(move |(kind, n)| match kind {
            0 => Operation::fetch(&request),
            1 => Operation::put(&request, json!(n), Some(Meta::lazy())),
            2 => Operation::put(&request, json!(n), None),
            3 => Operation::buffer(&request, json!(n)),
            4 => Operation::complete(&request, (n % 2 == 0).then(|| json!(n))),
            5 => Operation::reject(&request, FetchError::msg(n.to_string())),
            6 => Operation::cancel(&request),
            _ => Operation::dispose(&request),
        })
    }

    /// Sequences of operations on one request.
    pub fn arb_operations(request: Request, max_len: usize) -> impl Strategy<Value = Vec<Operation>> {
        proptest::collection::vec(arb_operation(request), 0..=max_len)
    }
}

pub use mocks::{deferred, manual_observable, ObservableController, Resolver, ScriptedHandler};
pub use recorders::{Delivery, OperationLog, SnapshotLog};
pub use transition_test::{assertions, TransitionTest};
