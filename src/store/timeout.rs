//! Deadline wrapper for slow stores.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{CounterStore, StoreError};

/// Bounds every call on an inner store with a deadline.
///
/// A call that misses the deadline fails with [`StoreError::Timeout`]. The
/// inner operation is dropped, so a timed-out increment may or may not have
/// been applied by the backend.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: CounterStore> TimeoutStore<S> {
    /// Wrap `inner`, failing any call that takes longer than `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for TimeoutStore<S> {
    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        match tokio::time::timeout(self.timeout, self.inner.get(key)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "Store read timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        match tokio::time::timeout(self.timeout, self.inner.increment_with_expiry(key, ttl)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "Store increment timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}
