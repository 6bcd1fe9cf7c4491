//! In-process counter store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// Options for [`MemoryStore::with_config`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreConfig {
    /// Number of internal map shards. Must be a power of two greater than 1.
    /// Defaults to the map's own choice based on available parallelism.
    pub shard_amount: Option<usize>,
}

/// A single counter and the instant it stops counting.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl CounterEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A [`CounterStore`] held in a sharded concurrent map.
///
/// Expiry is lazy: an expired entry reads as zero and is restarted on the
/// next increment, whether or not it has been physically removed.
/// [`MemoryStore::sweep_expired`] reclaims expired entries.
pub struct MemoryStore {
    counters: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.counters.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store driven by the system clock.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create an empty store with explicit options.
    pub fn with_config(config: MemoryStoreConfig) -> Result<Self, StoreError> {
        let counters = match config.shard_amount {
            None => DashMap::new(),
            Some(shards) if shards > 1 && shards.is_power_of_two() => {
                DashMap::with_shard_amount(shards)
            }
            Some(shards) => {
                return Err(StoreError::InvalidConfig(format!(
                    "shard amount must be a power of two greater than 1, got {}",
                    shards
                )))
            }
        };

        Ok(Self {
            counters,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used to stamp and check expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of entries physically held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Remove every expired entry and return how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        self.counters.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Swept expired counters");
        }
        removed
    }

    /// Sweep expired entries every `interval` on the tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped. Abort the returned handle to stop it earlier.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));

        info!(interval_ms = interval.as_millis() as u64, "Starting counter sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep_expired();
                    }
                    None => {
                        debug!("Store dropped, stopping counter sweeper");
                        break;
                    }
                }
            }
        })
    }

    fn read(&self, key: &str) -> u64 {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| StoreError::InvalidConfig(format!("ttl {:?} is out of range", ttl)))?;

        // The entry guard holds the shard lock, so the expiry check and the
        // add are one step for every other caller.
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(CounterEntry { count: 0, expires_at });

        if entry.is_expired(now) {
            *entry = CounterEntry { count: 0, expires_at };
        }
        entry.count += 1;

        Ok(entry.count)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.read(key))
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.increment(key, ttl)
    }
}
