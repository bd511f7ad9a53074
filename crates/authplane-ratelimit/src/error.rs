//! Error types for rate-limit decisions.

use authplane_storage::StorageError;
use thiserror::Error;

/// Result alias for limiter operations.
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Failure while deciding whether to admit a request.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The counter store failed.
    #[error("rate limit storage operation failed")]
    Storage {
        /// Storage operation identifier.
        operation: &'static str,
        /// Counter key.
        key: String,
        /// Source storage error.
        source: StorageError,
    },
}
