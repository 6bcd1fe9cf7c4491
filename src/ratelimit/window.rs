//! Bucket grid arithmetic.
//!
//! Time is cut into fixed-size buckets anchored at the Unix epoch, so every
//! process looking at the same wall clock agrees on bucket boundaries without
//! talking to each other. A window is the `bucket_count` consecutive buckets
//! ending at the current one.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{RestrictorError, Result};

/// Prefix shared by every bucket key this crate writes to a store.
const KEY_PREFIX: &str = "restrictor|";
const KEY_SEPARATOR: char = '|';

/// The epoch-anchored grid of buckets for one limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketGrid {
    /// Length of one bucket in nanoseconds
    bucket_nanos: i64,
    /// Number of buckets in a window
    bucket_count: u32,
}

impl BucketGrid {
    /// Build a grid that splits `window` into `bucket_count` equal buckets.
    ///
    /// Rejects a zero window, a zero bucket count, and windows that do not
    /// divide evenly, since a truncated bucket would silently shorten the
    /// effective window.
    pub fn new(window: Duration, bucket_count: u32) -> Result<Self> {
        if window.is_zero() {
            return Err(RestrictorError::Config("window must be positive".into()));
        }
        if bucket_count == 0 {
            return Err(RestrictorError::Config(
                "bucket count must be at least 1".into(),
            ));
        }

        let window_nanos = i64::try_from(window.as_nanos()).map_err(|_| {
            RestrictorError::Config(format!("window {:?} is too large", window))
        })?;
        let count = i64::from(bucket_count);

        if window_nanos % count != 0 {
            return Err(RestrictorError::Config(format!(
                "window {:?} is not evenly divisible into {} buckets",
                window, bucket_count
            )));
        }

        Ok(Self {
            bucket_nanos: window_nanos / count,
            bucket_count,
        })
    }

    /// Number of buckets in a window.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Length of one bucket.
    pub fn bucket_duration(&self) -> Duration {
        Duration::from_nanos(self.bucket_nanos as u64)
    }

    /// Length of the whole window.
    pub fn window(&self) -> Duration {
        self.bucket_duration() * self.bucket_count
    }

    /// How long a bucket counter has to live in the store.
    ///
    /// A counter is summed while its index is within `bucket_count - 1` of
    /// the current one, i.e. for at most one window after it was first
    /// written. One extra bucket absorbs clock skew between callers and the
    /// store.
    pub fn counter_ttl(&self) -> Duration {
        self.window() + self.bucket_duration()
    }

    /// Index of the bucket containing `at`.
    ///
    /// Uses floor division so instants before the epoch land in negative
    /// buckets instead of sharing bucket 0 with the first instants after it.
    pub fn bucket_index(&self, at: DateTime<Utc>) -> Result<i64> {
        let nanos = at
            .timestamp_nanos_opt()
            .ok_or_else(|| RestrictorError::TimestampOutOfRange(at.to_rfc3339()))?;
        Ok(nanos.div_euclid(self.bucket_nanos))
    }

    /// Indices of the buckets in the window ending at `current`, newest first.
    ///
    /// Stops early at `i64::MIN`; there are no buckets before it.
    pub fn window_indices(&self, current: i64) -> impl Iterator<Item = i64> {
        (0..i64::from(self.bucket_count)).map_while(move |age| current.checked_sub(age))
    }

    /// Whether a bucket at `index` still counts toward the window ending at
    /// `current`.
    pub fn in_window(&self, current: i64, index: i64) -> bool {
        index <= current
            && current
                .checked_sub(index)
                .map_or(false, |age| age < i64::from(self.bucket_count))
    }
}

/// Identifies one (subject, bucket) counter in a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The rate-limited subject
    pub subject: String,
    /// Epoch-anchored bucket index
    pub index: i64,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(subject: &str, index: i64) -> Self {
        Self {
            subject: subject.to_string(),
            index,
        }
    }

    /// Serialize to the opaque string used as a store key.
    /// Format: "restrictor|{subject}|{index}"
    ///
    /// The index never contains the separator, so subjects that do cannot
    /// collide with another (subject, index) pair.
    pub fn to_store_key(&self) -> String {
        format!("{}{}{}{}", KEY_PREFIX, self.subject, KEY_SEPARATOR, self.index)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}
