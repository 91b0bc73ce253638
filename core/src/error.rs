//! The error value carried by `reject` operations.

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a fetch handler or one of its sources.
///
/// This is a *value*: it travels inside [`Operation`](crate::operation::Operation)s,
/// lands in subscribers' hands and is cloned freely. Any `std::error::Error`
/// can be wrapped with [`FetchError::new`], keeping its `source()` chain.
///
/// Two errors compare equal when they render the same message.
///
/// # Examples
///
/// ```
/// use fetchflow_core::error::FetchError;
///
/// let err = FetchError::msg("connection reset");
/// assert_eq!(err, FetchError::msg("connection reset"));
/// assert_eq!(err.to_string(), "connection reset");
/// ```
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// Plain message
    #[error("{0}")]
    Message(String),

    /// Wrapped error from a handler or transport
    #[error(transparent)]
    Source(Arc<dyn StdError + Send + Sync + 'static>),

    /// A source future or generator step panicked
    #[error("source panicked: {0}")]
    Panicked(String),

    /// A retrying handler gave up
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made, including the first one
        attempts: u32,
        /// The error of the last attempt
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Build an error from a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wrap any error.
    #[must_use]
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Source(Arc::new(error))
    }

    /// Turn a panic payload (as returned by `catch_unwind`) into an error.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::Panicked(message)
    }

    /// Whether this error came from a panicking source.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

impl PartialEq for FetchError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Source(a), Self::Source(b)) if Arc::ptr_eq(a, b) => true,
            _ => self.to_string() == other.to_string(),
        }
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error)
    }
}
