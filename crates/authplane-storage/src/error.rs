//! Error types for secondary storage.

use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by [`crate::SecondaryStorage`] implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key held no live value.
    #[error("key not found")]
    NotFound {
        /// Key that was requested.
        key: String,
    },
    /// The stored value could not be interpreted as a counter.
    #[error("stored value is not an integer")]
    InvalidValue {
        /// Key holding the value.
        key: String,
        /// Offending value.
        value: String,
    },
    /// The TTL could not be represented as a timestamp offset.
    #[error("ttl out of range")]
    InvalidTtl {
        /// Requested TTL in milliseconds.
        millis: u128,
    },
    /// The backing database failed.
    #[error("storage database operation failed")]
    Database {
        /// Operation identifier.
        operation: &'static str,
        /// Source data-layer error.
        source: authplane_data::DataError,
    },
}

impl StorageError {
    pub(crate) const fn database(
        operation: &'static str,
        source: authplane_data::DataError,
    ) -> Self {
        Self::Database { operation, source }
    }
}
