//! Counter store trait for abstracting the in-memory and Redis backends.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors a counter store can report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, closed, ...)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something we cannot interpret
    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// State of one fixed window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    /// Requests counted in the current window
    pub count: u64,
    /// Time left until the counter expires
    pub ttl: Duration,
}

/// Trait for counter store implementations.
///
/// Implementations must make [`CounterStore::increment`] atomic: under any
/// number of concurrent calls for one key, every caller observes a distinct
/// count and the expiry is set once, when the key is created.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to the counter at `key`, creating it with a lifetime of
    /// `window` if it does not exist. An existing counter keeps its expiry.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCounter, StoreError>;

    /// Read the counter at `key` without changing it. `None` if absent.
    async fn peek(&self, key: &str) -> Result<Option<WindowCounter>, StoreError>;

    /// Remove the counter at `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every counter whose key starts with `prefix`, returning how many
    /// were removed. Meant for test cleanup, not request paths.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;
}
