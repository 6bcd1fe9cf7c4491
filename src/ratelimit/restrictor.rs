//! The admission decision engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::{debug, info, trace, warn};

use super::locks::SubjectLocks;
use super::window::{BucketGrid, BucketKey};
use crate::clock::{Clock, SystemClock};
use crate::config::RestrictorConfig;
use crate::error::{RestrictorError, Result};
use crate::store::CounterStore;

/// Default number of lock stripes.
const DEFAULT_LOCK_STRIPES: usize = 256;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The action may proceed and has been counted
    Admitted,
    /// The subject is at its limit; nothing was counted
    Denied,
}

impl Decision {
    /// Whether the action may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }

    /// Whether the action was refused.
    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied)
    }
}

/// A subject's consumption of its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    /// Admissions counted in the trailing window
    pub total: u64,
    /// Configured limit
    pub limit: u64,
    /// Admissions left before the subject is denied
    pub remaining: u64,
}

/// Keyed sliding-window rate limiter.
///
/// Each decision sums the subject's bucket counters over the trailing window
/// and, if the sum is under the limit, increments the current bucket. The
/// whole read-sum-compare-increment sequence runs under the subject's lock
/// stripe, so concurrent callers can never jointly overshoot the limit.
/// Counts are never cached: every decision re-reads the store, which may be
/// shared with other restrictors.
pub struct Restrictor<S: CounterStore> {
    grid: BucketGrid,
    limit: u64,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    locks: SubjectLocks,
}

impl<S: CounterStore> std::fmt::Debug for Restrictor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restrictor")
            .field("grid", &self.grid)
            .field("limit", &self.limit)
            .field("lock_stripes", &self.locks.len())
            .finish()
    }
}

impl<S: CounterStore> Restrictor<S> {
    /// Create a restrictor admitting at most `limit` actions per subject in
    /// any `window`, tracked in `bucket_count` buckets.
    ///
    /// Fails if the window is zero, the bucket count is zero, or the window
    /// does not split evenly into the buckets.
    pub fn new(window: Duration, limit: u64, bucket_count: u32, store: Arc<S>) -> Result<Self> {
        let grid = BucketGrid::new(window, bucket_count)?;

        info!(
            window_ms = window.as_millis() as u64,
            limit,
            bucket_count,
            "Restrictor initialized"
        );

        Ok(Self {
            grid,
            limit,
            store,
            clock: Arc::new(SystemClock),
            locks: SubjectLocks::new(DEFAULT_LOCK_STRIPES),
        })
    }

    /// Create a restrictor from configuration.
    pub fn from_config(config: &RestrictorConfig, store: Arc<S>) -> Result<Self> {
        Self::new(config.window(), config.limit, config.bucket_count, store)?
            .with_lock_stripes(config.lock_stripes)
    }

    /// Replace the clock used by [`Restrictor::decide`] and [`Restrictor::usage`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resize the lock table.
    pub fn with_lock_stripes(mut self, stripes: usize) -> Result<Self> {
        if stripes == 0 {
            return Err(RestrictorError::Config(
                "lock stripes must be at least 1".into(),
            ));
        }
        self.locks = SubjectLocks::new(stripes);
        Ok(self)
    }

    /// The configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The rolling window.
    pub fn window(&self) -> Duration {
        self.grid.window()
    }

    /// The bucket grid.
    pub fn grid(&self) -> &BucketGrid {
        &self.grid
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether `subject` may act now.
    pub async fn decide(&self, subject: &str) -> Result<Decision> {
        self.decide_at_time(self.clock.now(), subject).await
    }

    /// Decide whether `subject` may act at `at`.
    ///
    /// `at` need not be monotonic across calls; each call lands in whatever
    /// bucket its instant maps to. A store failure is returned as an error
    /// and nothing is admitted.
    pub async fn decide_at_time(&self, at: DateTime<Utc>, subject: &str) -> Result<Decision> {
        if subject.is_empty() {
            return Err(RestrictorError::EmptySubject);
        }
        let current = self.grid.bucket_index(at)?;

        let _guard = self.locks.lock(subject).await;

        let total = self.window_total(subject, current).await?;
        if total >= self.limit {
            debug!(
                subject = %subject,
                bucket = current,
                total,
                limit = self.limit,
                "Rate limit exceeded"
            );
            return Ok(Decision::Denied);
        }

        let key = BucketKey::new(subject, current);
        let count = self
            .store
            .increment_with_expiry(&key.to_store_key(), self.grid.counter_ttl())
            .await?;

        trace!(
            subject = %subject,
            bucket = current,
            total = total + 1,
            bucket_total = count,
            "Admitted"
        );

        Ok(Decision::Admitted)
    }

    /// Like [`Restrictor::decide`], but any error becomes [`Decision::Denied`].
    ///
    /// For callers that need a plain verdict and would rather refuse traffic
    /// than let it through unmetered while the store is failing.
    pub async fn admit_or_deny(&self, subject: &str) -> Decision {
        match self.decide(subject).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Decision failed, denying");
                Decision::Denied
            }
        }
    }

    /// Report `subject`'s usage of the current window without counting anything.
    pub async fn usage(&self, subject: &str) -> Result<Usage> {
        self.usage_at_time(self.clock.now(), subject).await
    }

    /// Report `subject`'s usage of the window ending at `at`.
    pub async fn usage_at_time(&self, at: DateTime<Utc>, subject: &str) -> Result<Usage> {
        if subject.is_empty() {
            return Err(RestrictorError::EmptySubject);
        }
        let current = self.grid.bucket_index(at)?;

        let total = {
            let _guard = self.locks.lock(subject).await;
            self.window_total(subject, current).await?
        };

        Ok(Usage {
            total,
            limit: self.limit,
            remaining: self.limit.saturating_sub(total),
        })
    }

    /// Sum of the subject's counters over the window ending at `current`.
    ///
    /// Only indices inside the window are read, so a counter the store has
    /// not yet expired still cannot leak into the sum.
    async fn window_total(&self, subject: &str, current: i64) -> Result<u64> {
        let keys: Vec<String> = self
            .grid
            .window_indices(current)
            .inspect(|&index| debug_assert!(self.grid.in_window(current, index)))
            .map(|index| BucketKey::new(subject, index).to_store_key())
            .collect();

        let counts = try_join_all(keys.iter().map(|key| self.store.get(key))).await?;

        Ok(counts.into_iter().fold(0u64, u64::saturating_add))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn reference_instant() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn create_restrictor(limit: u64, buckets: u32) -> Restrictor<MemoryStore> {
        Restrictor::new(
            Duration::from_secs(2),
            limit,
            buckets,
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    /// A store whose operations fail on demand.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn get(&self, key: &str) -> std::result::Result<u64, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("read refused".into()));
            }
            self.inner.get(key).await
        }

        async fn increment_with_expiry(
            &self,
            key: &str,
            ttl: Duration,
        ) -> std::result::Result<u64, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("write refused".into()));
            }
            self.inner.increment_with_expiry(key, ttl).await
        }
    }

    #[test]
    fn test_construction_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new());

        let zero_window = Restrictor::new(Duration::ZERO, 5, 2, store.clone());
        assert!(matches!(zero_window, Err(RestrictorError::Config(_))));

        let zero_buckets = Restrictor::new(Duration::from_secs(2), 5, 0, store.clone());
        assert!(matches!(zero_buckets, Err(RestrictorError::Config(_))));

        let uneven = Restrictor::new(Duration::from_secs(1), 5, 3, store.clone());
        assert!(matches!(uneven, Err(RestrictorError::Config(_))));

        let no_stripes = Restrictor::new(Duration::from_secs(2), 5, 2, store)
            .unwrap()
            .with_lock_stripes(0);
        assert!(matches!(no_stripes, Err(RestrictorError::Config(_))));
    }

    #[test]
    fn test_from_config() {
        let config = RestrictorConfig {
            window_ms: 60_000,
            limit: 10,
            bucket_count: 6,
            lock_stripes: 16,
        };
        let restrictor = Restrictor::from_config(&config, Arc::new(MemoryStore::new())).unwrap();

        assert_eq!(restrictor.limit(), 10);
        assert_eq!(restrictor.window(), Duration::from_secs(60));
        assert_eq!(restrictor.grid().bucket_duration(), Duration::from_secs(10));
        assert_eq!(restrictor.locks.len(), 16);
    }

    #[tokio::test]
    async fn test_zero_limit_denies_everything() {
        let restrictor = create_restrictor(0, 2);
        let at = reference_instant();

        for _ in 0..3 {
            let decision = restrictor.decide_at_time(at, "client").await.unwrap();
            assert_eq!(decision, Decision::Denied);
        }
        assert!(restrictor.store().is_empty());
    }

    #[tokio::test]
    async fn test_denials_are_not_counted() {
        let restrictor = create_restrictor(3, 2);
        let at = reference_instant();

        for _ in 0..3 {
            assert!(restrictor.decide_at_time(at, "client").await.unwrap().is_admitted());
        }
        for _ in 0..10 {
            assert!(restrictor.decide_at_time(at, "client").await.unwrap().is_denied());
        }

        let usage = restrictor.usage_at_time(at, "client").await.unwrap();
        assert_eq!(usage, Usage { total: 3, limit: 3, remaining: 0 });
    }

    #[tokio::test]
    async fn test_single_bucket_is_fixed_window() {
        let restrictor = create_restrictor(2, 1);
        let t0 = reference_instant();

        assert!(restrictor.decide_at_time(t0, "c").await.unwrap().is_admitted());
        let late = t0 + chrono::Duration::milliseconds(1999);
        assert!(restrictor.decide_at_time(late, "c").await.unwrap().is_admitted());
        assert!(restrictor.decide_at_time(late, "c").await.unwrap().is_denied());

        // The next fixed window starts clean even though the last admission
        // was a millisecond ago.
        let next = t0 + chrono::Duration::seconds(2);
        assert!(restrictor.decide_at_time(next, "c").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_backdated_timestamp_lands_in_its_own_bucket() {
        let restrictor = create_restrictor(2, 2);
        let t0 = reference_instant();

        assert!(restrictor.decide_at_time(t0, "c").await.unwrap().is_admitted());
        assert!(restrictor.decide_at_time(t0, "c").await.unwrap().is_admitted());

        // Far in the past: its window holds none of the admissions above
        let past = t0 - chrono::Duration::seconds(10);
        assert!(restrictor.decide_at_time(past, "c").await.unwrap().is_admitted());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_admission_trace_reports_bucket_total() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let restrictor = create_restrictor(5, 2);
        restrictor.decide_at_time(reference_instant(), "c").await.unwrap();
        restrictor.decide_at_time(reference_instant(), "c").await.unwrap();

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        let admitted: Vec<&str> = output.lines().filter(|l| l.contains("Admitted")).collect();
        assert_eq!(admitted.len(), 2);
        assert!(admitted[1].contains("bucket_total=2"));
        assert!(!admitted[1].contains("bucket_count="));
    }

    #[tokio::test]
    async fn test_earliest_representable_instant() {
        let restrictor = Restrictor::new(
            Duration::from_nanos(2),
            1,
            2,
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let earliest = DateTime::<Utc>::from_timestamp_nanos(i64::MIN);

        assert!(restrictor.decide_at_time(earliest, "a").await.unwrap().is_admitted());
        assert!(restrictor.decide_at_time(earliest, "a").await.unwrap().is_denied());

        let usage = restrictor.usage_at_time(earliest, "a").await.unwrap();
        assert_eq!(usage.total, 1);
    }

    #[tokio::test]
    async fn test_empty_subject_is_rejected() {
        let restrictor = create_restrictor(5, 2);
        assert!(matches!(
            restrictor.decide("").await,
            Err(RestrictorError::EmptySubject)
        ));
        assert!(matches!(
            restrictor.usage("").await,
            Err(RestrictorError::EmptySubject)
        ));
    }

    #[tokio::test]
    async fn test_store_read_failure_fails_closed() {
        let store = Arc::new(FlakyStore::default());
        let restrictor = Restrictor::new(Duration::from_secs(2), 5, 2, store.clone()).unwrap();

        store.fail_reads.store(true, Ordering::SeqCst);
        let result = restrictor.decide("client").await;
        assert!(matches!(result, Err(RestrictorError::Store(StoreError::Unavailable(_)))));
        assert_eq!(restrictor.admit_or_deny("client").await, Decision::Denied);
        assert!(store.inner.is_empty());

        store.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(restrictor.admit_or_deny("client").await, Decision::Admitted);
    }

    #[tokio::test]
    async fn test_store_write_failure_fails_closed() {
        let store = Arc::new(FlakyStore::default());
        let restrictor = Restrictor::new(Duration::from_secs(2), 5, 2, store.clone()).unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        assert_err!(restrictor.decide("client").await);
        assert_eq!(restrictor.admit_or_deny("client").await, Decision::Denied);

        // Reads still work and nothing was recorded
        let usage = assert_ok!(restrictor.usage("client").await);
        assert_eq!(usage.total, 0);
    }

    #[tokio::test]
    async fn test_decide_uses_injected_clock() {
        let clock = ManualClock::new(reference_instant());
        let restrictor = create_restrictor(1, 2).with_clock(Arc::new(clock.clone()));

        assert!(restrictor.decide("c").await.unwrap().is_admitted());
        assert!(restrictor.decide("c").await.unwrap().is_denied());

        clock.advance(Duration::from_secs(2));
        assert!(restrictor.decide("c").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_other_subject_proceeds_while_one_is_locked() {
        let restrictor = create_restrictor(5, 2);
        let busy = "busy";
        let other = (0..)
            .map(|i| format!("other-{}", i))
            .find(|s| restrictor.locks.stripe_of(s) != restrictor.locks.stripe_of(busy))
            .unwrap();

        let _held = restrictor.locks.lock(busy).await;

        let decision = tokio::time::timeout(Duration::from_millis(200), restrictor.decide(&other))
            .await
            .expect("decision for another subject should not wait on the held stripe")
            .unwrap();
        assert!(decision.is_admitted());

        let blocked = tokio::time::timeout(Duration::from_millis(50), restrictor.decide(busy)).await;
        assert!(blocked.is_err());
    }
}
