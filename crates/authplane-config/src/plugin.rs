//! Contract between the host and its plugins.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use authplane_events::{EventBus, EventHandler};
use axum::Router;
use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::hooks::Shared;
use crate::manager::ConfigManager;
use crate::model::RateLimitRule;

/// Descriptive plugin metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique name, also used as the migration ledger key.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Short description.
    pub description: String,
}

/// Services handed to a plugin during initialization.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Live configuration.
    pub config: ConfigManager,
    /// Internal event bus.
    pub event_bus: EventBus,
    /// Database pool, when one is configured.
    pub db: Option<PgPool>,
}

/// One SQL migration owned by a plugin. Applied at most once per name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMigration {
    /// Stable migration name.
    pub name: String,
    /// SQL executed inside a transaction.
    pub sql: String,
}

impl PluginMigration {
    /// Build a migration.
    #[must_use]
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Request attributes visible to rate-limit rules.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the server root.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Peer address as reported by the transport, usually `host:port`.
    pub remote_addr: Option<String>,
}

impl RequestMeta {
    /// Metadata for `method path` with no headers or peer.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            remote_addr: None,
        }
    }
}

/// Rule evaluated against each request.
pub type DynamicRuleFn = dyn Fn(&RequestMeta) -> RateLimitRule + Send + Sync;

/// Where a plugin rule comes from.
#[derive(Clone)]
pub enum RuleSource {
    /// Fixed rule.
    Static(RateLimitRule),
    /// Rule computed per request.
    Dynamic(Shared<DynamicRuleFn>),
}

impl RuleSource {
    /// Rule computed per request by `rule`.
    #[must_use]
    pub fn dynamic<F>(rule: F) -> Self
    where
        F: Fn(&RequestMeta) -> RateLimitRule + Send + Sync + 'static,
    {
        let rule: Arc<DynamicRuleFn> = Arc::new(rule);
        Self::Dynamic(Shared::from_arc(rule))
    }

    /// Resolve the rule for `request`.
    #[must_use]
    pub fn resolve(&self, request: &RequestMeta) -> RateLimitRule {
        match self {
            Self::Static(rule) => *rule,
            Self::Dynamic(rule) => rule(request),
        }
    }
}

impl fmt::Debug for RuleSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(rule) => formatter.debug_tuple("Static").field(rule).finish(),
            Self::Dynamic(_) => formatter.write_str("Dynamic(..)"),
        }
    }
}

/// Path-keyed rate-limit rules contributed by a plugin.
#[derive(Debug, Clone)]
pub struct PluginRateLimit {
    /// Owning plugin name, used in logs.
    pub plugin: String,
    /// Whether this rule set participates in resolution.
    pub enabled: bool,
    /// Rules keyed by exact request path.
    pub rules: BTreeMap<String, RuleSource>,
}

impl PluginRateLimit {
    /// Empty enabled rule set.
    #[must_use]
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            enabled: true,
            rules: BTreeMap::new(),
        }
    }

    /// Add a rule for `path`.
    #[must_use]
    pub fn with_rule(mut self, path: impl Into<String>, rule: RuleSource) -> Self {
        self.rules.insert(path.into(), rule);
        self
    }
}

/// Handler a plugin attaches to an event type.
#[derive(Clone)]
pub struct PluginEventHook {
    /// Event type, without the bus prefix.
    pub event_type: String,
    /// Handler invoked per event.
    pub handler: EventHandler,
}

impl fmt::Debug for PluginEventHook {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PluginEventHook")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Extension loaded into the host.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Descriptive metadata.
    fn metadata(&self) -> PluginMetadata;

    /// Disabled plugins are skipped by every registry operation.
    fn enabled(&self) -> bool;

    /// Called once before the server starts.
    async fn init(&self, ctx: &PluginContext) -> anyhow::Result<()>;

    /// SQL migrations, in order.
    fn migrations(&self) -> Vec<PluginMigration> {
        Vec::new()
    }

    /// Rate-limit rules for the plugin's paths.
    fn rate_limit(&self) -> Option<PluginRateLimit> {
        None
    }

    /// Routes mounted under the auth base path.
    fn routes(&self) -> Option<Router> {
        None
    }

    /// Event handlers subscribed after initialization.
    fn event_hooks(&self) -> Vec<PluginEventHook> {
        Vec::new()
    }

    /// Called on shutdown and before a restart.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
