//! Closure-based plugins for extensions that need no custom type.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use authplane_config::{
    Plugin, PluginContext, PluginEventHook, PluginMetadata, PluginMigration, PluginRateLimit,
};
use authplane_events::EventHandler;
use axum::Router;

/// Boxed future returned by lifecycle callbacks.
pub type LifecycleFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type InitFn = dyn Fn(PluginContext) -> LifecycleFuture + Send + Sync;
type CloseFn = dyn Fn() -> LifecycleFuture + Send + Sync;

/// Fluent builder for a [`SimplePlugin`].
#[must_use]
pub struct PluginBuilder {
    plugin: SimplePlugin,
}

impl PluginBuilder {
    /// Start an enabled plugin named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            plugin: SimplePlugin {
                metadata: PluginMetadata {
                    name: name.into(),
                    ..PluginMetadata::default()
                },
                enabled: true,
                init: None,
                close: None,
                migrations: Vec::new(),
                rate_limit: None,
                routes: None,
                event_hooks: Vec::new(),
            },
        }
    }

    /// Set the version string.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.plugin.metadata.version = version.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.plugin.metadata.description = description.into();
        self
    }

    /// Enable or disable the plugin.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.plugin.enabled = enabled;
        self
    }

    /// Run `init` during registry initialization.
    #[must_use]
    pub fn on_init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: Arc<InitFn> =
            Arc::new(move |ctx: PluginContext| -> LifecycleFuture { Box::pin(init(ctx)) });
        self.plugin.init = Some(callback);
        self
    }

    /// Run `close` on shutdown.
    #[must_use]
    pub fn on_close<F, Fut>(mut self, close: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: Arc<CloseFn> = Arc::new(move || -> LifecycleFuture { Box::pin(close()) });
        self.plugin.close = Some(callback);
        self
    }

    /// Append a SQL migration.
    #[must_use]
    pub fn migration(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.plugin.migrations.push(PluginMigration::new(name, sql));
        self
    }

    /// Contribute rate-limit rules.
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: PluginRateLimit) -> Self {
        self.plugin.rate_limit = Some(rate_limit);
        self
    }

    /// Contribute routes mounted under the auth base path.
    #[must_use]
    pub fn routes(mut self, routes: Router) -> Self {
        self.plugin.routes = Some(routes);
        self
    }

    /// Subscribe `handler` to `event_type` once the plugin is initialized.
    #[must_use]
    pub fn event_hook(mut self, event_type: impl Into<String>, handler: EventHandler) -> Self {
        self.plugin.event_hooks.push(PluginEventHook {
            event_type: event_type.into(),
            handler,
        });
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> SimplePlugin {
        self.plugin
    }
}

/// Plugin assembled from closures and static parts.
pub struct SimplePlugin {
    metadata: PluginMetadata,
    enabled: bool,
    init: Option<Arc<InitFn>>,
    close: Option<Arc<CloseFn>>,
    migrations: Vec<PluginMigration>,
    rate_limit: Option<PluginRateLimit>,
    routes: Option<Router>,
    event_hooks: Vec<PluginEventHook>,
}

impl fmt::Debug for SimplePlugin {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SimplePlugin")
            .field("metadata", &self.metadata)
            .field("enabled", &self.enabled)
            .field("migrations", &self.migrations.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Plugin for SimplePlugin {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn init(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        match &self.init {
            Some(init) => init(ctx.clone()).await,
            None => Ok(()),
        }
    }

    fn migrations(&self) -> Vec<PluginMigration> {
        self.migrations.clone()
    }

    fn rate_limit(&self) -> Option<PluginRateLimit> {
        self.rate_limit.clone()
    }

    fn routes(&self) -> Option<Router> {
        self.routes.clone()
    }

    fn event_hooks(&self) -> Vec<PluginEventHook> {
        self.event_hooks.clone()
    }

    async fn close(&self) -> anyhow::Result<()> {
        match &self.close {
            Some(close) => close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_metadata_and_defaults() {
        let plugin = PluginBuilder::new("audit")
            .version("1.2.0")
            .description("Audit trail")
            .migration("0001_entries", "SELECT 1")
            .build();
        let metadata = plugin.metadata();
        assert_eq!(metadata.name, "audit");
        assert_eq!(metadata.version, "1.2.0");
        assert!(plugin.enabled());
        assert_eq!(plugin.migrations().len(), 1);
        assert!(plugin.rate_limit().is_none());
        assert!(plugin.routes().is_none());
        assert!(format!("{plugin:?}").contains("audit"));
    }

    #[tokio::test]
    async fn default_close_is_a_no_op() {
        let plugin = PluginBuilder::new("quiet").enabled(false).build();
        assert!(!plugin.enabled());
        plugin.close().await.expect("no-op close");
    }
}
