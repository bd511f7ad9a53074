//! Error types for configuration operations.

use authplane_data::DataError;
use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration failed a validation rule.
    #[error("configuration validation failed")]
    Validation {
        /// Dot path of the offending field.
        field: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A field held a value of the wrong shape for its type.
    #[error("invalid configuration field")]
    InvalidField {
        /// Dot path that was being written.
        field: String,
        /// Decoding error detail.
        source: serde_json::Error,
    },
    /// No settings record exists for the key yet.
    #[error("configuration has not been initialized")]
    NotInitialized {
        /// Settings key that was looked up.
        key: String,
    },
    /// Converting between the typed model and its JSON form failed.
    #[error("configuration serialization failed")]
    Serialization {
        /// Operation identifier.
        operation: &'static str,
        /// Source serde error.
        source: serde_json::Error,
    },
    /// Parsing a YAML configuration document failed.
    #[error("invalid configuration document")]
    Document {
        /// Source YAML error.
        source: serde_yaml::Error,
    },
    /// The settings store does not offer the requested capability.
    #[error("settings store capability unavailable")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Settings store operation failed.
    #[error("settings store operation failed")]
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Source data-layer error.
        source: DataError,
    },
}

impl ConfigError {
    pub(crate) fn validation(
        field: impl Into<String>,
        reason: &'static str,
        value: Option<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            reason,
            value,
        }
    }

    /// Whether the error was caused by the submitted values rather than I/O.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::InvalidField { .. })
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;
