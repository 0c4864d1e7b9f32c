//! Error types for the Floodgate core.

use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Invalid caller input or limiter configuration. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A shared-storage failure that survived the retry policy.
    ///
    /// The core surfaces these as-is; translating an outage into an
    /// allow/deny decision (fail-open vs. fail-closed) is caller policy.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type alias for rate limiter operations.
pub type Result<T, E = RateLimitError> = std::result::Result<T, E>;
