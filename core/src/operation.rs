//! Operations - the messages flowing through the engine.
//!
//! Every change in a request's lifecycle, whether asked for by a caller
//! (`fetch`, `cancel`, `dispose`) or observed from a source (`put`, `buffer`,
//! `complete`, `reject`), is described by an immutable [`Operation`].

use crate::error::FetchError;
use crate::request::{Request, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The kind of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Request (re)issuance
    Fetch,
    /// A single value delivered
    Put,
    /// A value delivered while awaiting the completion signal
    Buffer,
    /// Terminal success
    Complete,
    /// Caller-initiated abort
    Cancel,
    /// Terminal failure
    Reject,
    /// Removal of every trace of the request
    Dispose,
}

impl OperationKind {
    /// Lowercase name, used for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Put => "put",
            Self::Buffer => "buffer",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::Reject => "reject",
            Self::Dispose => "dispose",
        }
    }

    /// Whether operations of this kind may overwrite the stored data.
    #[must_use]
    pub const fn carries_data(self) -> bool {
        matches!(self, Self::Put | Self::Buffer | Self::Complete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra information attached to a `put`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Meta {
    /// `true` when the value is one chunk of a pull-driven stream that rests
    /// until the next "fetch more"
    pub lazy: bool,
}

impl Meta {
    /// Meta for a chunk of a lazily pulled stream.
    #[must_use]
    pub const fn lazy() -> Self {
        Self { lazy: true }
    }

    /// Meta for an eagerly pushed value (buffer semantics).
    #[must_use]
    pub const fn eager() -> Self {
        Self { lazy: false }
    }
}

/// Payload shared by every operation kind.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    request: Request,
    data: Option<Value>,
    error: Option<FetchError>,
    meta: Option<Meta>,
}

/// An immutable lifecycle message about one request.
///
/// # Examples
///
/// ```
/// use fetchflow_core::operation::{Meta, Operation, OperationKind};
/// use fetchflow_core::request::Request;
/// use serde_json::json;
///
/// let request = Request::from_id("users");
/// let op = Operation::put(&request, json!([1, 2]), Some(Meta::lazy()));
///
/// assert_eq!(op.kind(), OperationKind::Put);
/// assert!(op.is_lazy());
/// assert_eq!(op.data(), Some(&json!([1, 2])));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    kind: OperationKind,
    payload: Payload,
}

impl Operation {
    const fn with(kind: OperationKind, payload: Payload) -> Self {
        Self { kind, payload }
    }

    fn bare(kind: OperationKind, request: &Request) -> Self {
        Self::with(
            kind,
            Payload {
                request: request.clone(),
                data: None,
                error: None,
                meta: None,
            },
        )
    }

    /// Issue (or re-issue) a request.
    #[must_use]
    pub fn fetch(request: &Request) -> Self {
        Self::bare(OperationKind::Fetch, request)
    }

    /// Deliver a single value.
    #[must_use]
    pub fn put(request: &Request, data: Value, meta: Option<Meta>) -> Self {
        let mut op = Self::bare(OperationKind::Put, request);
        op.payload.data = Some(data);
        op.payload.meta = meta;
        op
    }

    /// Deliver a value while the source has not signalled completion yet.
    #[must_use]
    pub fn buffer(request: &Request, data: Value) -> Self {
        let mut op = Self::bare(OperationKind::Buffer, request);
        op.payload.data = Some(data);
        op
    }

    /// Terminal success, optionally carrying a final payload.
    #[must_use]
    pub fn complete(request: &Request, data: Option<Value>) -> Self {
        let mut op = Self::bare(OperationKind::Complete, request);
        op.payload.data = data;
        op
    }

    /// Terminal failure.
    #[must_use]
    pub fn reject(request: &Request, error: FetchError) -> Self {
        let mut op = Self::bare(OperationKind::Reject, request);
        op.payload.error = Some(error);
        op
    }

    /// Abort an in-flight or streaming request.
    #[must_use]
    pub fn cancel(request: &Request) -> Self {
        Self::bare(OperationKind::Cancel, request)
    }

    /// Remove all trace of a request.
    #[must_use]
    pub fn dispose(request: &Request) -> Self {
        Self::bare(OperationKind::Dispose, request)
    }

    /// The kind of this operation.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The request this operation is about.
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.payload.request
    }

    /// Shorthand for `self.request().id()`.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        self.payload.request.id()
    }

    /// The delivered value, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.payload.data.as_ref()
    }

    /// The failure, for `reject` operations.
    #[must_use]
    pub const fn error(&self) -> Option<&FetchError> {
        self.payload.error.as_ref()
    }

    /// Meta attached to a `put`.
    #[must_use]
    pub const fn meta(&self) -> Option<Meta> {
        self.payload.meta
    }

    /// Whether this is a lazy chunk (`put` with `meta.lazy == true`).
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.kind == OperationKind::Put && self.payload.meta.is_some_and(|m| m.lazy)
    }

    /// Whether this operation overwrites the stored data when committed.
    #[must_use]
    pub const fn overwrites_data(&self) -> bool {
        self.kind.carries_data() && self.payload.data.is_some()
    }

    /// Take the delivered value out of the operation.
    #[must_use]
    pub fn into_data(self) -> Option<Value> {
        self.payload.data
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.payload.request.id())
    }
}
