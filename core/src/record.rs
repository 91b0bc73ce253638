//! What the store knows about one request.

use crate::operation::Operation;
use crate::state::{transition, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-request entry in the store.
///
/// `data` survives every transition except disposal: it is the latest value
/// delivered by a `put`, `buffer` or `complete` that carried one. For
/// streaming sources that is the most recent chunk, accumulating chunks is
/// left to whoever consumes the data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Current lifecycle state
    pub state: State,
    /// Latest delivered value
    pub data: Option<Value>,
}

impl RequestRecord {
    /// A record with no data yet.
    #[must_use]
    pub const fn new(state: State) -> Self {
        Self { state, data: None }
    }

    /// Apply an operation to an optional record.
    ///
    /// Returns the record that should be stored afterwards: `None` when the
    /// operation disposes the request, or when there was no record and the
    /// operation does not create one.
    ///
    /// # Examples
    ///
    /// ```
    /// use fetchflow_core::operation::Operation;
    /// use fetchflow_core::record::RequestRecord;
    /// use fetchflow_core::request::Request;
    /// use fetchflow_core::state::State;
    /// use serde_json::json;
    ///
    /// let request = Request::from_id("users");
    /// let pending = RequestRecord::apply(None, &Operation::fetch(&request)).unwrap();
    /// let done = RequestRecord::apply(
    ///     Some(pending),
    ///     &Operation::complete(&request, Some(json!(["Dan"]))),
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(done.state, State::Completed);
    /// assert_eq!(done.data, Some(json!(["Dan"])));
    /// ```
    #[must_use]
    pub fn apply(current: Option<Self>, op: &Operation) -> Option<Self> {
        let state = transition(current.as_ref().map(|r| r.state), op)?;
        if state == State::Disposed {
            return None;
        }

        let mut data = current.and_then(|r| r.data);
        if op.overwrites_data() {
            data = op.data().cloned();
        }

        Some(Self { state, data })
    }
}
