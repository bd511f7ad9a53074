//! Application-level errors for bootstrap and the hosting loop.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration operations failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: authplane_config::ConfigError,
    },
    /// Data layer operations failed.
    #[error("data operation failed")]
    Data {
        /// Operation identifier.
        operation: &'static str,
        /// Source data error.
        source: authplane_data::DataError,
    },
    /// Connecting to the database failed.
    #[error("database connection failed")]
    Database {
        /// Operation identifier.
        operation: &'static str,
        /// Source sqlx error.
        source: sqlx::Error,
    },
    /// Plugin lifecycle operations failed.
    #[error("plugin operation failed")]
    Plugin {
        /// Operation identifier.
        operation: &'static str,
        /// Source plugin error.
        source: authplane_plugins::PluginError,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: authplane_telemetry::TelemetryError,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Optional path involved in the failure.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
    /// Configuration values were invalid.
    #[error("invalid configuration")]
    InvalidConfig {
        /// Field name that failed validation.
        field: &'static str,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Optional value associated with the failure.
        value: Option<String>,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: authplane_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn data(operation: &'static str, source: authplane_data::DataError) -> Self {
        Self::Data { operation, source }
    }

    pub(crate) const fn plugin(
        operation: &'static str,
        source: authplane_plugins::PluginError,
    ) -> Self {
        Self::Plugin { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: authplane_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: None,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn helpers_build_variants_with_sources() {
        let io_err = AppError::io("server.bind", io::Error::other("in use"));
        assert!(matches!(
            io_err,
            AppError::Io {
                operation: "server.bind",
                path: None,
                ..
            }
        ));
        assert!(io_err.source().is_some());

        let config = AppError::config(
            "config.init",
            authplane_config::ConfigError::NotInitialized {
                key: "runtime_config".into(),
            },
        );
        assert_eq!(config.to_string(), "configuration operation failed");

        let invalid = AppError::InvalidConfig {
            field: "AUTHPLANE_PORT",
            reason: "zero",
            value: Some("0".into()),
        };
        assert!(invalid.source().is_none());
    }
}
