//! Service wiring for the standalone server.

use std::sync::Arc;
use std::time::Duration;

use authplane_config::{
    ConfigManager, Configuration, MEMORY_TRANSPORT, MemorySettingsStore, PgSettingsStore,
    SecondaryStorageKind, SettingsStore, Shared,
};
use authplane_events::{EventBus, EventBusOptions, InMemoryPubSub, PubSub};
use authplane_storage::{
    DatabaseStorage, DatabaseStorageOptions, MemoryStorage, MemoryStorageOptions,
    SecondaryStorage,
};
use authplane_telemetry::{GlobalContextGuard, LoggingConfig, Metrics};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::server;
use crate::settings::AppSettings;

/// Long-lived services shared by every server generation.
#[derive(Clone)]
pub struct Services {
    /// Live configuration.
    pub config: ConfigManager,
    /// Database pool when `DATABASE_URL` is set.
    pub pool: Option<PgPool>,
    /// Secondary storage backing rate-limit counters.
    pub storage: Arc<dyn SecondaryStorage>,
    /// Internal event bus.
    pub bus: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Key required on admin routes.
    pub admin_api_key: Arc<str>,
    /// Listener port.
    pub port: u16,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Services")
            .field("config", &self.config)
            .field("database", &self.pool.is_some())
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Build services from `settings` over the configuration they describe.
    ///
    /// # Errors
    ///
    /// Returns an error when the database, storage, transport or persisted
    /// configuration cannot be set up.
    pub async fn build(settings: &AppSettings) -> AppResult<Self> {
        Self::build_with(settings, settings.configuration()).await
    }

    /// Build services from `settings` over an explicit initial configuration,
    /// for hosts that register plugins or hooks programmatically.
    ///
    /// # Errors
    ///
    /// Returns an error when the database, storage, transport or persisted
    /// configuration cannot be set up.
    pub async fn build_with(settings: &AppSettings, mut initial: Configuration) -> AppResult<Self> {
        let pool = match &settings.database_url {
            Some(url) => Some(connect(url, &initial).await?),
            None => None,
        };
        if let Some(pool) = &pool {
            authplane_data::run_migrations(pool)
                .await
                .map_err(|err| AppError::data("data.run_migrations", err))?;
        }
        initial.db.clone_from(&pool);

        let storage = select_storage(&initial, pool.as_ref())?;
        initial.secondary_storage.storage = Some(Shared::from_arc(Arc::clone(&storage)));

        authplane_config::validate(&initial)
            .map_err(|err| AppError::config("config.validate", err))?;

        let settings_store: Arc<dyn SettingsStore> = match &pool {
            Some(pool) => Arc::new(PgSettingsStore::new(pool.clone())),
            None => Arc::new(MemorySettingsStore::new()),
        };
        let config = ConfigManager::new(initial, settings_store);
        config
            .init()
            .await
            .map_err(|err| AppError::config("config.init", err))?;

        // The persisted record may name a different transport than the
        // initial configuration did.
        let current = config.config();
        let bus = EventBus::with_options(bus_options(&current), select_transport(&current)?);
        let metrics =
            Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;

        info!(
            database = pool.is_some(),
            storage = ?current.secondary_storage.kind,
            transport = %current.event_bus.transport,
            "services ready"
        );

        Ok(Self {
            config,
            pool,
            storage,
            bus,
            metrics,
            admin_api_key: Arc::from(settings.admin_api_key.as_str()),
            port: settings.port,
        })
    }
}

async fn connect(url: &str, config: &Configuration) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database.max_open_conns.max(1))
        .min_connections(
            config
                .database
                .max_idle_conns
                .min(config.database.max_open_conns),
        )
        .max_lifetime(Some(config.database.conn_max_lifetime))
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .map_err(|source| AppError::Database {
            operation: "database.connect",
            source,
        })
}

fn select_storage(
    config: &Configuration,
    pool: Option<&PgPool>,
) -> AppResult<Arc<dyn SecondaryStorage>> {
    if let Some(storage) = &config.secondary_storage.storage {
        return Ok(Arc::clone(storage.as_arc()));
    }
    match config.secondary_storage.kind {
        SecondaryStorageKind::Memory => {
            let storage: Arc<dyn SecondaryStorage> = MemoryStorage::start(MemoryStorageOptions {
                cleanup_interval: config.secondary_storage.memory.cleanup_interval,
            });
            Ok(storage)
        }
        SecondaryStorageKind::Database => {
            let pool = pool.ok_or(AppError::InvalidConfig {
                field: "secondary_storage.type",
                reason: "requires_database",
                value: Some("database".to_string()),
            })?;
            let storage: Arc<dyn SecondaryStorage> = DatabaseStorage::start(
                pool.clone(),
                DatabaseStorageOptions {
                    cleanup_interval: config.secondary_storage.database.cleanup_interval,
                },
            );
            Ok(storage)
        }
    }
}

/// Bus options carried by `config`.
pub(crate) fn bus_options(config: &Configuration) -> EventBusOptions {
    EventBusOptions {
        prefix: config.event_bus.prefix.clone(),
        max_concurrent_handlers: config.event_bus.max_concurrent_handlers,
    }
}

/// Transport named by `config`: the host-supplied handle when present,
/// otherwise a fresh bundled transport.
pub(crate) fn select_transport(config: &Configuration) -> AppResult<Arc<dyn PubSub>> {
    if let Some(pubsub) = &config.event_bus.pubsub {
        return Ok(Arc::clone(pubsub.as_arc()));
    }
    if config.event_bus.transport != MEMORY_TRANSPORT {
        return Err(AppError::InvalidConfig {
            field: "event_bus.transport",
            reason: "unsupported_transport",
            value: Some(config.event_bus.transport.clone()),
        });
    }
    let transport: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::new());
    Ok(transport)
}

/// Entry point for the standalone server.
///
/// # Errors
///
/// Returns an error if logging, service construction or the hosting loop fails.
pub async fn run_app() -> AppResult<()> {
    let settings = AppSettings::from_env()?;
    authplane_telemetry::init_logging(&LoggingConfig {
        format: settings.log_format,
        ..LoggingConfig::default()
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let _context = GlobalContextGuard::new("authplane");

    info!("authplane bootstrap starting");
    let services = Services::build(&settings).await?;
    server::run(services).await
}
