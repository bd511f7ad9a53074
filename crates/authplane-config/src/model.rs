//! Typed configuration model.
//!
//! Every section deserializes with defaults so a partial document (YAML
//! file, stored JSON, merged update) always yields a complete value.
//! Durations are persisted as whole seconds.

use std::collections::BTreeMap;
use std::time::Duration;

use authplane_events::PubSub;
use authplane_storage::SecondaryStorage;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{ConfigError, ConfigResult};
use crate::hooks::{
    DatabaseHooks, EndpointHooks, EventHooks, PasswordHooks, SendEmailChangeFn, SendEmailFn,
    Shared,
};
use crate::plugin::Plugin;

/// Default rate-limit window.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// Default requests admitted per window.
pub const DEFAULT_RATE_LIMIT_MAX: u64 = 100;

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// How the process hosts the auth toolkit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Embedded in another application; no persisted configuration.
    Library,
    /// Standalone server with database-backed configuration.
    #[default]
    Standalone,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Display name of the application.
    pub app_name: String,
    /// Public base URL of the server.
    pub base_url: String,
    /// Mount point of the auth routes.
    pub base_path: String,
    /// Signing secret.
    pub secret: String,
    /// Hosting mode.
    #[serde(skip)]
    pub mode: Mode,
    /// Live database pool.
    #[serde(skip)]
    pub db: Option<PgPool>,
    /// Primary database settings.
    pub database: DatabaseConfig,
    /// Secondary storage settings.
    pub secondary_storage: SecondaryStorageConfig,
    /// Email and password authentication.
    pub email_password: EmailPasswordConfig,
    /// Email verification flow.
    pub email_verification: EmailVerificationConfig,
    /// User self-service settings.
    pub user: UserConfig,
    /// Session cookie settings.
    pub session: SessionConfig,
    /// CSRF protection.
    pub csrf: CsrfConfig,
    /// Origins allowed to call the API.
    pub trusted_origins: TrustedOriginsConfig,
    /// Request admission control.
    pub rate_limit: RateLimitConfig,
    /// Hooks around endpoint handling.
    #[serde(skip)]
    pub endpoint_hooks: EndpointHooks,
    /// Hooks around entity persistence.
    #[serde(skip)]
    pub database_hooks: DatabaseHooks,
    /// Hooks fired on auth lifecycle events.
    #[serde(skip)]
    pub event_hooks: EventHooks,
    /// Internal event bus.
    pub event_bus: EventBusConfig,
    /// Loaded plugins, in registration order.
    #[serde(skip)]
    pub plugins: Vec<Shared<dyn Plugin>>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            app_name: "Authplane".to_string(),
            base_url: "http://localhost:8080".to_string(),
            base_path: "/auth".to_string(),
            secret: String::new(),
            mode: Mode::default(),
            db: None,
            database: DatabaseConfig::default(),
            secondary_storage: SecondaryStorageConfig::default(),
            email_password: EmailPasswordConfig::default(),
            email_verification: EmailVerificationConfig::default(),
            user: UserConfig::default(),
            session: SessionConfig::default(),
            csrf: CsrfConfig::default(),
            trusted_origins: TrustedOriginsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            endpoint_hooks: EndpointHooks::default(),
            database_hooks: DatabaseHooks::default(),
            event_hooks: EventHooks::default(),
            event_bus: EventBusConfig::default(),
            plugins: Vec::new(),
        }
    }
}

impl Configuration {
    /// Parse a YAML document over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Document`] when the document is malformed.
    pub fn from_yaml_str(document: &str) -> ConfigResult<Self> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(document).map_err(|source| ConfigError::Document { source })
    }
}

/// Primary database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database provider name.
    pub provider: String,
    /// Connection string.
    pub connection_string: String,
    /// Pool size upper bound.
    pub max_open_conns: u32,
    /// Connections kept idle.
    pub max_idle_conns: u32,
    /// Maximum connection lifetime.
    #[serde(with = "seconds")]
    pub conn_max_lifetime: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: "postgres".to_string(),
            connection_string: String::new(),
            max_open_conns: 8,
            max_idle_conns: 2,
            conn_max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

/// Backend used for secondary storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryStorageKind {
    /// In-process map.
    #[default]
    Memory,
    /// `key_value_store` table.
    Database,
}

/// Options for the in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStorageSettings {
    /// Sweep interval.
    #[serde(with = "seconds")]
    pub cleanup_interval: Duration,
}

impl Default for MemoryStorageSettings {
    fn default() -> Self {
        Self {
            cleanup_interval: authplane_storage::DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Options for the database store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseStorageSettings {
    /// Expired-row sweep interval.
    #[serde(with = "seconds")]
    pub cleanup_interval: Duration,
}

impl Default for DatabaseStorageSettings {
    fn default() -> Self {
        Self {
            cleanup_interval: authplane_storage::DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Secondary storage settings and live handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryStorageConfig {
    /// Selected backend.
    #[serde(rename = "type")]
    pub kind: SecondaryStorageKind,
    /// Memory backend options.
    pub memory: MemoryStorageSettings,
    /// Database backend options.
    pub database: DatabaseStorageSettings,
    /// Live store handle.
    #[serde(skip)]
    pub storage: Option<Shared<dyn SecondaryStorage>>,
}

/// Email and password authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailPasswordConfig {
    /// Whether the method is offered.
    pub enabled: bool,
    /// Shortest accepted password.
    pub min_password_length: u32,
    /// Longest accepted password.
    pub max_password_length: u32,
    /// Reject new registrations.
    pub disable_sign_up: bool,
    /// Block sign-in until the email is verified.
    pub require_email_verification: bool,
    /// Create a session right after sign-up.
    pub auto_sign_in: bool,
    /// Lifetime of reset tokens.
    #[serde(with = "seconds")]
    pub reset_token_expiry: Duration,
    /// Reset mail sender.
    #[serde(skip)]
    pub send_reset_password_email: Option<Shared<SendEmailFn>>,
    /// Hashing overrides.
    #[serde(skip)]
    pub password: PasswordHooks,
}

impl Default for EmailPasswordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_password_length: 8,
            max_password_length: 128,
            disable_sign_up: false,
            require_email_verification: false,
            auto_sign_in: true,
            reset_token_expiry: Duration::from_secs(60 * 60),
            send_reset_password_email: None,
            password: PasswordHooks::default(),
        }
    }
}

/// Email verification flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailVerificationConfig {
    /// Create a session once verified.
    pub auto_sign_in: bool,
    /// Send on sign-up.
    pub send_on_sign_up: bool,
    /// Send on sign-in for unverified users.
    pub send_on_sign_in: bool,
    /// Lifetime of verification tokens.
    #[serde(with = "seconds")]
    pub expires_in: Duration,
    /// Verification mail sender.
    #[serde(skip)]
    pub send_verification_email: Option<Shared<SendEmailFn>>,
}

impl Default for EmailVerificationConfig {
    fn default() -> Self {
        Self {
            auto_sign_in: false,
            send_on_sign_up: false,
            send_on_sign_in: false,
            expires_in: Duration::from_secs(60 * 60),
            send_verification_email: None,
        }
    }
}

/// Email change flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeEmailConfig {
    /// Whether users may change their email.
    pub enabled: bool,
    /// Confirmation mail sender.
    #[serde(skip)]
    pub send_email_change_verification_email: Option<Shared<SendEmailChangeFn>>,
}

/// User self-service settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Email change flow.
    pub change_email: ChangeEmailConfig,
}

/// Session cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie name.
    pub cookie_name: String,
    /// Session lifetime.
    #[serde(with = "seconds")]
    pub expires_in: Duration,
    /// Minimum age before a session is refreshed.
    #[serde(with = "seconds")]
    pub update_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "authplane.session_token".to_string(),
            expires_in: Duration::from_secs(7 * 24 * 60 * 60),
            update_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// CSRF protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Whether tokens are enforced.
    pub enabled: bool,
    /// Cookie carrying the token.
    pub cookie_name: String,
    /// Header echoing the token.
    pub header_name: String,
    /// Token lifetime.
    #[serde(with = "seconds")]
    pub expires_in: Duration,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: "authplane_csrf_token".to_string(),
            header_name: "X-AUTHPLANE-CSRF-TOKEN".to_string(),
            expires_in: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Origins allowed to call the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustedOriginsConfig {
    /// Exact origins.
    pub origins: Vec<String>,
}

/// A resolved fixed-window rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitRule {
    /// Skip limiting entirely for the matched path.
    pub disabled: bool,
    /// Window length.
    #[serde(with = "seconds")]
    pub window: Duration,
    /// Requests admitted per window.
    pub max: u64,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            disabled: false,
            window: DEFAULT_RATE_LIMIT_WINDOW,
            max: DEFAULT_RATE_LIMIT_MAX,
        }
    }
}

impl RateLimitRule {
    /// Rule that admits everything.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            disabled: true,
            window: DEFAULT_RATE_LIMIT_WINDOW,
            max: DEFAULT_RATE_LIMIT_MAX,
        }
    }

    /// Rule with explicit bounds.
    #[must_use]
    pub const fn new(window: Duration, max: u64) -> Self {
        Self {
            disabled: false,
            window,
            max,
        }
    }
}

/// Client address extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    /// Headers consulted in order before the peer address.
    pub headers: Vec<String>,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            headers: vec!["X-Forwarded-For".to_string(), "X-Real-IP".to_string()],
        }
    }
}

/// Request admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Master switch.
    pub enabled: bool,
    /// Default window.
    #[serde(with = "seconds")]
    pub window: Duration,
    /// Default requests per window.
    pub max: u64,
    /// Counting algorithm; only `fixed-window` is implemented.
    pub algorithm: String,
    /// Namespace for counter keys.
    pub prefix: String,
    /// Per-path rules overriding the default.
    pub custom_rules: BTreeMap<String, RateLimitRule>,
    /// Client address extraction.
    pub ip: IpConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: DEFAULT_RATE_LIMIT_WINDOW,
            max: DEFAULT_RATE_LIMIT_MAX,
            algorithm: "fixed-window".to_string(),
            prefix: "ratelimit:".to_string(),
            custom_rules: BTreeMap::new(),
            ip: IpConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// The global default as a rule.
    #[must_use]
    pub const fn default_rule(&self) -> RateLimitRule {
        RateLimitRule::new(self.window, self.max)
    }
}

/// Transport name served by the bundled in-memory pub/sub.
pub const MEMORY_TRANSPORT: &str = "memory";

/// Internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Whether events are published at all.
    pub enabled: bool,
    /// Topic namespace.
    pub prefix: String,
    /// Handlers allowed to run at once.
    pub max_concurrent_handlers: usize,
    /// Transport kind; changing it needs a restart.
    pub transport: String,
    /// Live transport handle.
    #[serde(skip)]
    pub pubsub: Option<Shared<dyn PubSub>>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "authplane".to_string(),
            max_concurrent_handlers: 10,
            transport: MEMORY_TRANSPORT.to_string(),
            pubsub: None,
        }
    }
}

/// Copy every non-serializable field from `source` onto `target`.
///
/// Any field marked `#[serde(skip)]` in this module must be listed here or
/// it is reset to its default on the next reload.
pub fn preserve_runtime_fields(target: &mut Configuration, source: &Configuration) {
    target.mode = source.mode;
    target.db.clone_from(&source.db);
    target
        .secondary_storage
        .storage
        .clone_from(&source.secondary_storage.storage);
    target
        .email_password
        .send_reset_password_email
        .clone_from(&source.email_password.send_reset_password_email);
    target
        .email_password
        .password
        .clone_from(&source.email_password.password);
    target
        .email_verification
        .send_verification_email
        .clone_from(&source.email_verification.send_verification_email);
    target
        .user
        .change_email
        .send_email_change_verification_email
        .clone_from(&source.user.change_email.send_email_change_verification_email);
    target.endpoint_hooks.clone_from(&source.endpoint_hooks);
    target.database_hooks.clone_from(&source.database_hooks);
    target.event_hooks.clone_from(&source.event_hooks);
    target.event_bus.pubsub.clone_from(&source.event_bus.pubsub);
    target.plugins.clone_from(&source.plugins);
}

/// Whether moving from `old` to `new` needs the listeners restarted.
#[must_use]
pub fn requires_restart(old: &Configuration, new: &Configuration) -> bool {
    old.base_url != new.base_url
        || old.base_path != new.base_path
        || old.event_bus.transport != new.event_bus.transport
}
