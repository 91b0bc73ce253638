//! Engine configuration.

use std::time::Duration;

/// Configuration for an [`Engine`](crate::Engine).
///
/// # Example
///
/// ```
/// use fetchflow_runtime::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_max_age(Duration::from_secs(5))
///     .with_operation_broadcast_capacity(1024);
///
/// assert_eq!(config.max_age, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a request may stay without subscribers before it is disposed
    ///
    /// Default: 30 seconds
    pub max_age: Duration,

    /// Capacity of the operation broadcast channel
    ///
    /// Observers of [`Engine::subscribe_operations`](crate::Engine::subscribe_operations)
    /// that fall further behind than this lose the oldest operations.
    ///
    /// Default: 256
    pub operation_broadcast_capacity: usize,
}

impl EngineConfig {
    /// Default inactivity window.
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);

    /// Default operation broadcast capacity.
    pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

    /// Create a configuration.
    #[must_use]
    pub const fn new(max_age: Duration, operation_broadcast_capacity: usize) -> Self {
        Self {
            max_age,
            operation_broadcast_capacity,
        }
    }

    /// Set the inactivity window.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the operation broadcast capacity.
    ///
    /// Zero is bumped to one when the engine is built.
    #[must_use]
    pub const fn with_operation_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.operation_broadcast_capacity = capacity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_AGE, Self::DEFAULT_BROADCAST_CAPACITY)
    }
}
