//! Request identity types.
//!
//! A [`Request`] is an opaque identity object: its [`RequestId`] is the only
//! thing the engine ever looks at. The descriptor travels along untouched so
//! handlers can read whatever they need from it (URL, query, variables, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Error type for `RequestId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid request ID: {0}")]
pub struct ParseRequestIdError(String);

/// Key identifying a request in the store.
///
/// Two requests with the same id are the same request as far as the engine
/// is concerned, whatever their descriptors say. Computing the id from the
/// descriptor (hashing, canonical serialization, ...) is the caller's job.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings
/// - `From::from()` and `new()`: no validation (trusted input)
///
/// # Examples
///
/// ```
/// use fetchflow_core::request::RequestId;
///
/// let id = RequestId::new("users?page=1");
/// assert_eq!(id.as_str(), "users?page=1");
///
/// let parsed: RequestId = "users?page=2".parse().unwrap();
/// assert_eq!(parsed, RequestId::new("users?page=2"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new `RequestId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the request ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `RequestId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseRequestIdError("Request ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An immutable request: identity plus an opaque descriptor.
///
/// Cloning is cheap, the descriptor is shared.
///
/// # Examples
///
/// ```
/// use fetchflow_core::request::Request;
/// use serde_json::json;
///
/// let request = Request::new("users", json!({ "url": "/api/users" }));
/// assert_eq!(request.id().as_str(), "users");
/// assert_eq!(request.descriptor()["url"], "/api/users");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    id: RequestId,
    descriptor: Arc<Value>,
}

impl Request {
    /// Create a request from an id and a descriptor.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, descriptor: Value) -> Self {
        Self {
            id: id.into(),
            descriptor: Arc::new(descriptor),
        }
    }

    /// Create a request that only carries an id (`null` descriptor).
    ///
    /// Useful for operations addressed purely by identity, such as a
    /// scheduled `dispose`.
    #[must_use]
    pub fn from_id(id: impl Into<RequestId>) -> Self {
        Self::new(id, Value::Null)
    }

    /// The identity of this request.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// The opaque descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Value {
        &self.descriptor
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
