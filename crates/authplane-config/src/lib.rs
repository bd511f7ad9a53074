#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Live runtime configuration for Authplane.
//!
//! Layout: `model.rs` (typed configuration and restart rules), `hooks.rs`
//! (non-serializable callbacks and handles), `merge.rs` (JSON tree merge and
//! dot-path writes), `validate.rs`, `store.rs` (settings persistence),
//! `manager.rs` (`ConfigManager` + watch loop), `plugin.rs` (plugin
//! contract), `emitter.rs` (auth lifecycle events).

pub mod emitter;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod merge;
pub mod model;
pub mod plugin;
pub mod store;
pub mod validate;

pub use emitter::AuthEventEmitter;
pub use error::{ConfigError, ConfigResult};
pub use hooks::{AuthUser, Shared};
pub use manager::{ConfigManager, DEFAULT_POLL_INTERVAL, WatchOptions};
pub use model::{
    Configuration, EventBusConfig, MEMORY_TRANSPORT, Mode, RateLimitConfig, RateLimitRule,
    SecondaryStorageKind, preserve_runtime_fields, requires_restart,
};
pub use plugin::{
    Plugin, PluginContext, PluginEventHook, PluginMetadata, PluginMigration, PluginRateLimit,
    RequestMeta, RuleSource,
};
pub use store::{MemorySettingsStore, PgSettingsStore, SettingsRecord, SettingsStore};
pub use validate::{MAX_RATE_LIMIT_WINDOW, validate};
