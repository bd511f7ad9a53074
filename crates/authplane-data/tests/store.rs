use std::time::Duration;

use anyhow::Result;
use authplane_data::{RUNTIME_CONFIG_KEY, kv, plugins, run_migrations, settings};
use authplane_test_support::postgres::start_postgres;
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

async fn connect(url: &str) -> Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[tokio::test]
async fn settings_row_insert_and_upsert() -> Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping settings_row_insert_and_upsert: {err}");
            return Ok(());
        }
    };
    let pool = connect(postgres.connection_string()).await?;

    assert!(settings::fetch_settings(&pool, RUNTIME_CONFIG_KEY).await?.is_none());

    let created =
        settings::insert_settings_if_absent(&pool, RUNTIME_CONFIG_KEY, &json!({"app_name": "a"}))
            .await?;
    assert!(created);
    let again =
        settings::insert_settings_if_absent(&pool, RUNTIME_CONFIG_KEY, &json!({"app_name": "b"}))
            .await?;
    assert!(!again);

    let row = settings::fetch_settings(&pool, RUNTIME_CONFIG_KEY)
        .await?
        .expect("row should exist");
    assert_eq!(row.value.0["app_name"], "a");

    let first = settings::upsert_settings(&pool, RUNTIME_CONFIG_KEY, &json!({"app_name": "c"}))
        .await?;
    let second = settings::upsert_settings(&pool, RUNTIME_CONFIG_KEY, &json!({"app_name": "d"}))
        .await?;
    assert!(first > row.updated_at);
    assert!(second > first);

    let stamp = settings::fetch_settings_updated_at(&pool, RUNTIME_CONFIG_KEY).await?;
    assert_eq!(stamp, Some(second));
    Ok(())
}

#[tokio::test]
async fn key_value_rows_expire_and_count() -> Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping key_value_rows_expire_and_count: {err}");
            return Ok(());
        }
    };
    let pool = connect(postgres.connection_string()).await?;

    kv::upsert_value(&pool, "plain", "v1", None).await?;
    assert_eq!(kv::fetch_value(&pool, "plain").await?.as_deref(), Some("v1"));

    let past = Utc::now() - chrono::Duration::seconds(5);
    kv::upsert_value(&pool, "stale", "old", Some(past)).await?;
    assert_eq!(kv::fetch_value(&pool, "stale").await?, None);
    assert!(!kv::delete_value(&pool, "stale").await?);

    let window = Some(Utc::now() + chrono::Duration::seconds(60));
    assert_eq!(kv::increment_counter(&pool, "rl:1.2.3.4", window).await?, 1);
    assert_eq!(kv::increment_counter(&pool, "rl:1.2.3.4", window).await?, 2);

    kv::upsert_value(&pool, "rl:expired", "9", Some(past)).await?;
    assert_eq!(kv::increment_counter(&pool, "rl:expired", window).await?, 1);

    assert!(kv::delete_value(&pool, "plain").await?);
    assert!(!kv::delete_value(&pool, "plain").await?);

    kv::upsert_value(&pool, "stale-2", "old", Some(past)).await?;
    assert!(kv::delete_expired(&pool).await? >= 1);
    Ok(())
}

#[tokio::test]
async fn plugin_migrations_run_once() -> Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping plugin_migrations_run_once: {err}");
            return Ok(());
        }
    };
    let pool = connect(postgres.connection_string()).await?;
    let sql = "CREATE TABLE audit_entries (id BIGSERIAL PRIMARY KEY, note TEXT NOT NULL)";

    assert!(plugins::apply_plugin_migration(&pool, "audit", "0001_entries", sql).await?);
    assert!(!plugins::apply_plugin_migration(&pool, "audit", "0001_entries", sql).await?);
    Ok(())
}
