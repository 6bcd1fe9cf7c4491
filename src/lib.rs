//! Restrictor - keyed sliding-window rate limiting
//!
//! This crate decides whether a subject's next action is admitted, based on
//! how many of its actions were admitted within a trailing window. Counts
//! live in a pluggable [`store::CounterStore`], so a single process can use
//! the in-memory store and a fleet can share any store with atomic
//! increments.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RestrictorError, Result};
pub use ratelimit::{Decision, Restrictor, Usage};
pub use store::{CounterStore, MemoryStore, StoreError};
