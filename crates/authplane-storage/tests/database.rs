use std::time::Duration;

use anyhow::Result;
use authplane_storage::{
    DatabaseStorage, DatabaseStorageOptions, SecondaryStorage, StorageError,
};
use authplane_test_support::postgres::start_postgres;
use sqlx::postgres::PgPoolOptions;

#[tokio::test]
async fn database_storage_matches_memory_semantics() -> Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping database_storage_matches_memory_semantics: {err}");
            return Ok(());
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(postgres.connection_string())
        .await?;
    authplane_data::run_migrations(&pool).await?;

    let storage = DatabaseStorage::start(
        pool,
        DatabaseStorageOptions {
            cleanup_interval: Duration::from_millis(50),
        },
    );

    assert_eq!(storage.get("missing").await?, None);
    storage.set("k", "v", None).await?;
    assert_eq!(storage.get("k").await?.as_deref(), Some("v"));
    storage.delete("k").await?;
    assert!(matches!(
        storage.delete("k").await,
        Err(StorageError::NotFound { .. })
    ));

    let window = Some(Duration::from_secs(60));
    assert_eq!(storage.increment("rl:10.0.0.1", window).await?, 1);
    assert_eq!(storage.increment("rl:10.0.0.1", window).await?, 2);
    assert_eq!(storage.get("rl:10.0.0.1").await?.as_deref(), Some("2"));

    storage
        .set("short", "v", Some(Duration::from_millis(10)))
        .await?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(storage.get("short").await?, None);
    assert!(storage.purge_expired().await? <= 1);

    storage.close();
    Ok(())
}
