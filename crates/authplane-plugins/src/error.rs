//! Error types for plugin lifecycle operations.

use authplane_data::DataError;
use authplane_events::EventBusError;
use thiserror::Error;

/// Failure raised while driving plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A plugin failed to initialize.
    #[error("plugin initialization failed")]
    Init {
        /// Plugin name.
        plugin: String,
        /// Error returned by the plugin.
        source: anyhow::Error,
    },
    /// A plugin migration failed to apply.
    #[error("plugin migration failed")]
    Migration {
        /// Plugin name.
        plugin: String,
        /// Migration name.
        migration: String,
        /// Data-layer error.
        source: DataError,
    },
    /// A plugin failed to shut down cleanly.
    #[error("plugin close failed")]
    Close {
        /// Plugin name.
        plugin: String,
        /// Error returned by the plugin.
        source: anyhow::Error,
    },
    /// Subscribing a plugin event hook failed.
    #[error("plugin event hook subscription failed")]
    Subscribe {
        /// Plugin name.
        plugin: String,
        /// Event type being subscribed.
        event_type: String,
        /// Bus error.
        source: EventBusError,
    },
    /// A plugin's routes overlap routes already contributed.
    #[error("plugin routes conflict: {detail}")]
    RouteConflict {
        /// Plugin name.
        plugin: String,
        /// Conflict reported by the router.
        detail: String,
    },
}

impl PluginError {
    /// Name of the plugin that failed.
    #[must_use]
    pub fn plugin(&self) -> &str {
        match self {
            Self::Init { plugin, .. }
            | Self::Migration { plugin, .. }
            | Self::Close { plugin, .. }
            | Self::Subscribe { plugin, .. }
            | Self::RouteConflict { plugin, .. } => plugin,
        }
    }
}

/// Convenience alias for plugin results.
pub type PluginResult<T> = Result<T, PluginError>;
