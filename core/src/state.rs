//! Request states and the pure transition function.
//!
//! The transition function is the only place that decides what an
//! operation does to a request. It has no I/O and no side effects; the
//! engine calls it twice per operation (once in the dedup gate, once when
//! committing to the store).
//!
//! A request without a record is in the implicit initial state, modelled as
//! `None` throughout this crate.
//!
//! | current | operation | next |
//! |---|---|---|
//! | none | fetch | pending |
//! | pending | put (lazy) | ready |
//! | pending | put (eager) / buffer | buffering |
//! | pending | complete | completed |
//! | pending | reject | failed |
//! | pending | cancel | cancelled |
//! | buffering | put (eager) / buffer | buffering |
//! | buffering | put (lazy) | ready |
//! | buffering | complete | ready |
//! | buffering | reject | failed |
//! | buffering | cancel | cancelled |
//! | ready | fetch | buffering |
//! | completed / cancelled / failed / disposed | fetch | pending |
//! | any | dispose | disposed |
//!
//! Every other pair leaves the state unchanged.

use crate::operation::{Operation, OperationKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// A handler invocation is in flight, nothing delivered yet
    Pending,
    /// A pull-driven stream delivered a chunk and waits for "fetch more"
    Ready,
    /// Values are arriving, completion not signalled yet
    Buffering,
    /// The source is exhausted
    Completed,
    /// Aborted by the caller
    Cancelled,
    /// The source failed
    Failed,
    /// The record is gone (never stored, only reported)
    Disposed,
}

impl State {
    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Ready,
        Self::Buffering,
        Self::Completed,
        Self::Cancelled,
        Self::Failed,
        Self::Disposed,
    ];

    /// Lowercase name, used for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Buffering => "buffering",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Disposed => "disposed",
        }
    }

    /// `completed`, `cancelled` or `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether a source may still be producing values for the request.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Buffering)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the next state of a request.
///
/// Pure, total and deterministic: pairs not listed in the module table
/// return `current` unchanged.
///
/// # Examples
///
/// ```
/// use fetchflow_core::operation::Operation;
/// use fetchflow_core::request::Request;
/// use fetchflow_core::state::{transition, State};
///
/// let request = Request::from_id("users");
///
/// let pending = transition(None, &Operation::fetch(&request));
/// assert_eq!(pending, Some(State::Pending));
///
/// // Re-issuing while pending is a no-op.
/// assert_eq!(transition(pending, &Operation::fetch(&request)), pending);
/// ```
#[must_use]
pub fn transition(current: Option<State>, op: &Operation) -> Option<State> {
    use OperationKind as K;
    use State as S;

    let next = match (current, op.kind()) {
        (_, K::Dispose) => S::Disposed,

        (None | Some(S::Disposed | S::Completed | S::Cancelled | S::Failed), K::Fetch) => {
            S::Pending
        },
        (Some(S::Ready), K::Fetch) => S::Buffering,

        (Some(S::Pending | S::Buffering), K::Put) if op.is_lazy() => S::Ready,
        (Some(S::Pending | S::Buffering), K::Put | K::Buffer) => S::Buffering,

        (Some(S::Pending), K::Complete) => S::Completed,
        (Some(S::Buffering), K::Complete) => S::Ready,

        (Some(S::Pending | S::Buffering), K::Reject) => S::Failed,
        (Some(S::Pending | S::Buffering), K::Cancel) => S::Cancelled,

        _ => return current,
    };

    Some(next)
}

/// Whether the engine drops `op` before it reaches any exchange.
///
/// An operation is redundant when it would not change the state, unless the
/// request is `buffering`: there a `fetch` is a legitimate "fetch more" and
/// must reach the fetch exchange even though the state stays put.
///
/// # Examples
///
/// ```
/// use fetchflow_core::operation::Operation;
/// use fetchflow_core::request::Request;
/// use fetchflow_core::state::{is_redundant, State};
///
/// let request = Request::from_id("users");
/// assert!(is_redundant(Some(State::Pending), &Operation::fetch(&request)));
/// assert!(!is_redundant(Some(State::Buffering), &Operation::fetch(&request)));
/// ```
#[must_use]
pub fn is_redundant(current: Option<State>, op: &Operation) -> bool {
    current != Some(State::Buffering) && transition(current, op) == current
}
