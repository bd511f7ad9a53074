use std::sync::Arc;

use anyhow::Result;
use authplane_config::{ConfigManager, Configuration, MemorySettingsStore, Plugin, PluginContext};
use authplane_events::EventBus;
use authplane_plugins::{PluginBuilder, PluginError, PluginRegistry};
use authplane_test_support::postgres::start_postgres;
use sqlx::postgres::PgPoolOptions;

fn registry(pool: &sqlx::PgPool) -> PluginRegistry {
    let mut registry = PluginRegistry::new(PluginContext {
        config: ConfigManager::new(
            Configuration::default(),
            Arc::new(MemorySettingsStore::new()),
        ),
        event_bus: EventBus::in_memory("authplane"),
        db: Some(pool.clone()),
    });
    let audit: Arc<dyn Plugin> = Arc::new(
        PluginBuilder::new("audit")
            .migration(
                "0001_audit_log",
                "CREATE TABLE audit_log (id BIGSERIAL PRIMARY KEY, entry TEXT NOT NULL)",
            )
            .migration(
                "0002_audit_index",
                "CREATE INDEX audit_log_entry_idx ON audit_log (entry)",
            )
            .build(),
    );
    let dormant: Arc<dyn Plugin> = Arc::new(
        PluginBuilder::new("dormant")
            .enabled(false)
            .migration("0001_never", "CREATE TABLE never_created (id INT)")
            .build(),
    );
    registry.register(audit);
    registry.register(dormant);
    registry
}

#[tokio::test]
async fn plugin_migrations_apply_once_per_name() -> Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping plugin_migrations_apply_once_per_name: {err}");
            return Ok(());
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(postgres.connection_string())
        .await?;
    authplane_data::run_migrations(&pool).await?;

    let registry = registry(&pool);
    assert_eq!(registry.run_migrations(&pool).await?, 2);
    assert_eq!(registry.run_migrations(&pool).await?, 0);

    sqlx::query("INSERT INTO audit_log (entry) VALUES ('signed-in')")
        .execute(&pool)
        .await?;
    let dormant: Option<String> = sqlx::query_scalar("SELECT to_regclass('never_created')::text")
        .fetch_one(&pool)
        .await?;
    assert!(dormant.is_none());
    Ok(())
}

#[tokio::test]
async fn failing_migrations_name_the_plugin() -> Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping failing_migrations_name_the_plugin: {err}");
            return Ok(());
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(postgres.connection_string())
        .await?;
    authplane_data::run_migrations(&pool).await?;

    let mut registry = registry(&pool);
    let broken: Arc<dyn Plugin> = Arc::new(
        PluginBuilder::new("broken")
            .migration("0001_bad", "CREATE TABLE (")
            .build(),
    );
    registry.register(broken);

    let err = registry
        .run_migrations(&pool)
        .await
        .expect_err("syntax error");
    assert!(matches!(
        err,
        PluginError::Migration { ref plugin, ref migration, .. }
            if plugin == "broken" && migration == "0001_bad"
    ));
    Ok(())
}
