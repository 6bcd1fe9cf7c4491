//! Error types for the restrictor.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for restrictor operations.
#[derive(Error, Debug)]
pub enum RestrictorError {
    /// Invalid construction parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store failed to read or write
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Subject keys must be non-empty
    #[error("Subject key must not be empty")]
    EmptySubject,

    /// Timestamps must be representable as i64 nanoseconds since the epoch
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(String),

    /// Configuration source errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for restrictor operations.
pub type Result<T> = std::result::Result<T, RestrictorError>;
