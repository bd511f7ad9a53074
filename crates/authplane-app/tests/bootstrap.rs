use anyhow::Result;
use authplane_app::{AppSettings, Services};
use authplane_config::SecondaryStorageKind;
use authplane_storage::SecondaryStorage as _;
use authplane_test_support::postgres::start_postgres;
use serde_json::json;

fn settings(database_url: &str) -> Result<AppSettings> {
    let database_url = database_url.to_string();
    Ok(AppSettings::from_lookup(move |name| match name {
        "DATABASE_URL" => Some(database_url.clone()),
        "AUTHPLANE_CONFIG_PATH" => Some("/nonexistent/authplane.yaml".to_string()),
        "AUTHPLANE_SECRET" => Some("integration-secret".to_string()),
        _ => None,
    })?)
}

#[tokio::test]
async fn persisted_configuration_survives_a_restart() -> Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping persisted_configuration_survives_a_restart: {err}");
            return Ok(());
        }
    };
    let settings = settings(postgres.connection_string())?;

    let first = Services::build(&settings).await?;
    assert!(first.pool.is_some());
    first.config.update("rate_limit.max", json!(9)).await?;
    first.storage.set("probe", "1", None).await?;

    let mut initial = settings.configuration();
    initial.secondary_storage.kind = SecondaryStorageKind::Database;
    let second = Services::build_with(&settings, initial).await?;
    assert_eq!(second.config.config().rate_limit.max, 9);
    assert_eq!(second.storage.get("probe").await?, None);
    second.storage.set("probe", "2", None).await?;
    assert_eq!(second.storage.get("probe").await?.as_deref(), Some("2"));
    Ok(())
}
