//! Striped per-subject locks.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;

use tokio::sync::{Mutex, MutexGuard};

/// A fixed arena of async mutexes indexed by a hash of the subject key.
///
/// Callers for the same subject always land on the same stripe and are
/// serialized. Callers for different subjects only wait on each other when
/// their keys hash to the same stripe.
pub(crate) struct SubjectLocks {
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl SubjectLocks {
    /// Create a table with `stripes` locks. `stripes` must be non-zero.
    pub(crate) fn new(stripes: usize) -> Self {
        debug_assert!(stripes > 0);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe index for `subject`.
    pub(crate) fn stripe_of(&self, subject: &str) -> usize {
        (self.hasher.hash_one(subject) % self.stripes.len() as u64) as usize
    }

    /// Wait for exclusive access to `subject`'s stripe.
    pub(crate) async fn lock(&self, subject: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(subject)].lock().await
    }
}
