//! Windowed counting and admission decisions.

mod locks;
mod restrictor;
pub mod window;

pub use restrictor::{Decision, Restrictor, Usage};
pub use window::{BucketGrid, BucketKey};
