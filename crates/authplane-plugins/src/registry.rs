//! Ordered plugin registry driving init, migration and shutdown.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use authplane_config::{Plugin, PluginContext, PluginRateLimit};
use authplane_data::plugins::apply_plugin_migration;
use authplane_events::{CancelToken, Subscription};
use axum::Router;
use sqlx::PgPool;
use tracing::{error, info, instrument};

use crate::error::{PluginError, PluginResult};

/// Plugins in registration order plus the context handed to them.
pub struct PluginRegistry {
    context: PluginContext,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .plugins
            .iter()
            .map(|plugin| plugin.metadata().name)
            .collect();
        formatter
            .debug_struct("PluginRegistry")
            .field("plugins", &names)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Empty registry sharing `context` with every plugin.
    #[must_use]
    pub const fn new(context: PluginContext) -> Self {
        Self {
            context,
            plugins: Vec::new(),
        }
    }

    /// Registry pre-populated with the plugins listed in the configuration.
    #[must_use]
    pub fn from_config(context: PluginContext) -> Self {
        let plugins = context
            .config
            .config()
            .plugins
            .iter()
            .map(|plugin| Arc::clone(plugin.as_arc()))
            .collect();
        Self { context, plugins }
    }

    /// Append a plugin.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Context shared with plugins.
    #[must_use]
    pub const fn context(&self) -> &PluginContext {
        &self.context
    }

    /// Enabled plugins in registration order.
    #[must_use]
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.enabled().cloned().collect()
    }

    fn enabled(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter().filter(|plugin| plugin.enabled())
    }

    /// Initialize enabled plugins in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Init`] for the first plugin that fails.
    #[instrument(name = "plugins.init_all", skip(self))]
    pub async fn init_all(&self) -> PluginResult<()> {
        for plugin in self.enabled() {
            let name = plugin.metadata().name;
            plugin
                .init(&self.context)
                .await
                .map_err(|source| PluginError::Init {
                    plugin: name.clone(),
                    source,
                })?;
            info!(plugin = %name, "plugin initialized");
        }
        Ok(())
    }

    /// Apply every pending migration of every enabled plugin.
    ///
    /// Returns how many migrations were newly applied.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Migration`] for the first failing migration.
    #[instrument(name = "plugins.run_migrations", skip(self, pool))]
    pub async fn run_migrations(&self, pool: &PgPool) -> PluginResult<usize> {
        let mut applied = 0;
        for plugin in self.enabled() {
            let name = plugin.metadata().name;
            for migration in plugin.migrations() {
                let fresh = apply_plugin_migration(pool, &name, &migration.name, &migration.sql)
                    .await
                    .map_err(|source| {
                        error!(plugin = %name, migration = %migration.name, "plugin migration failed");
                        PluginError::Migration {
                            plugin: name.clone(),
                            migration: migration.name.clone(),
                            source,
                        }
                    })?;
                if fresh {
                    info!(plugin = %name, migration = %migration.name, "plugin migration applied");
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    /// Close every enabled plugin, logging and collecting failures.
    pub async fn close_all(&self) -> Vec<PluginError> {
        let mut failures = Vec::new();
        for plugin in self.enabled() {
            let name = plugin.metadata().name;
            if let Err(source) = plugin.close().await {
                error!(plugin = %name, error = %source, "failed to close plugin");
                failures.push(PluginError::Close {
                    plugin: name,
                    source,
                });
            }
        }
        failures
    }

    /// Enabled rate-limit rule sets of enabled plugins, in registration order.
    #[must_use]
    pub fn rate_limits(&self) -> Vec<PluginRateLimit> {
        self.enabled()
            .filter_map(|plugin| plugin.rate_limit())
            .filter(|limits| limits.enabled)
            .collect()
    }

    /// Routes of every enabled plugin merged into one router.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::RouteConflict`] naming the first plugin whose
    /// routes overlap one already merged.
    pub fn router(&self) -> PluginResult<Router> {
        let mut router = Router::new();
        for plugin in self.enabled() {
            let Some(routes) = plugin.routes() else {
                continue;
            };
            // axum rejects overlapping routes by panicking inside `merge`.
            router = panic::catch_unwind(AssertUnwindSafe(move || router.merge(routes)))
                .map_err(|payload| {
                    let err = PluginError::RouteConflict {
                        plugin: plugin.metadata().name,
                        detail: panic_detail(payload.as_ref()),
                    };
                    error!(plugin = %err.plugin(), error = %err, "plugin routes conflict");
                    err
                })?;
        }
        Ok(router)
    }

    /// Subscribe the event hooks of every enabled plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Subscribe`] when the bus refuses a subscription.
    pub async fn subscribe_event_hooks(
        &self,
        cancel: &CancelToken,
    ) -> PluginResult<Vec<Subscription>> {
        let mut subscriptions = Vec::new();
        for plugin in self.enabled() {
            let name = plugin.metadata().name;
            for hook in plugin.event_hooks() {
                let subscription = self
                    .context
                    .event_bus
                    .subscribe(cancel, &hook.event_type, hook.handler)
                    .await
                    .map_err(|source| PluginError::Subscribe {
                        plugin: name.clone(),
                        event_type: hook.event_type.clone(),
                        source,
                    })?;
                subscriptions.push(subscription);
            }
        }
        Ok(subscriptions)
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&'static str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "overlapping routes".to_string())
}
