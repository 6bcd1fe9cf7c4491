//! Counter storage backends.
//!
//! The restrictor only needs two operations from a store: read a counter and
//! atomically bump it with an expiry. Anything that can provide those (an
//! in-process map, a shared cache) can back a restrictor.

mod memory;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use timeout::TimeoutStore;

/// Errors a counter store can report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store was configured with invalid parameters
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    /// The operation did not finish before its deadline
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Trait for counter store implementations.
///
/// Absent counters read as zero. `increment_with_expiry` must be a true
/// atomic add: concurrent increments of the same key are never lost.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value of the counter at `key`, or 0 if it is absent or expired.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Add one to the counter at `key` and return the new value.
    ///
    /// An absent or expired counter is created at 1 and expires `ttl` later.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        (**self).get(key).await
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        (**self).increment_with_expiry(key, ttl).await
    }
}
