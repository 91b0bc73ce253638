//! # Fetchflow Core
//!
//! Pure data and pure functions for the fetchflow data-fetching engine.
//!
//! Nothing in this crate performs I/O, spawns tasks or holds locks. The
//! runtime crate drives these types; tests can exercise them directly.
//!
//! ## Core Concepts
//!
//! - **Request**: opaque identity (`RequestId`) plus a descriptor the engine never reads
//! - **Operation**: immutable lifecycle message (`fetch`, `put`, `buffer`,
//!   `complete`, `cancel`, `reject`, `dispose`)
//! - **State**: where a request is in its lifecycle
//! - **Transition**: pure function `(Option<State>, &Operation) → Option<State>`
//! - **RequestRecord**: what the store keeps per request (`state` + latest `data`)
//! - **FetchError**: the failure value carried by `reject`
//!
//! ## Example
//!
//! ```
//! use fetchflow_core::{transition, Meta, Operation, Request, State};
//! use serde_json::json;
//!
//! let request = Request::new("feed", json!({ "url": "/api/feed" }));
//!
//! let state = transition(None, &Operation::fetch(&request));
//! assert_eq!(state, Some(State::Pending));
//!
//! // A lazily pulled chunk parks the stream in `ready` until "fetch more".
//! let state = transition(state, &Operation::put(&request, json!([1]), Some(Meta::lazy())));
//! assert_eq!(state, Some(State::Ready));
//! ```

pub use serde_json::Value;

/// Fetch failure value
pub mod error;

/// Operation model
pub mod operation;

/// Per-request store entry
pub mod record;

/// Request identity
pub mod request;

/// States and the transition function
pub mod state;

pub use error::FetchError;
pub use operation::{Meta, Operation, OperationKind};
pub use record::RequestRecord;
pub use request::{ParseRequestIdError, Request, RequestId};
pub use state::{is_redundant, transition, State};
