//! Persistence for the single-row runtime configuration record.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Executor, FromRow, Postgres};

use crate::error::{Result, map_query_err};

/// LISTEN/NOTIFY channel raised whenever a settings row is written.
pub const SETTINGS_CHANNEL: &str = "authplane_settings_changed";

/// Key of the row holding the live runtime configuration.
pub const RUNTIME_CONFIG_KEY: &str = "runtime_config";

/// Raw projection of the `auth_settings` table.
#[derive(Debug, Clone, FromRow)]
pub struct SettingsRow {
    /// Settings key.
    pub key: String,
    /// Serialized configuration document.
    pub value: Json<Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp; advances on every write.
    pub updated_at: DateTime<Utc>,
}

/// Fetch the settings row for `key`, if present.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn fetch_settings<'e, E>(executor: E, key: &str) -> Result<Option<SettingsRow>>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, SettingsRow>(
        "SELECT key, value, created_at, updated_at FROM auth_settings WHERE key = $1",
    )
    .bind(key)
    .fetch_optional(executor)
    .await
    .map_err(map_query_err("fetch settings"))
}

/// Fetch only the modification timestamp for `key`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn fetch_settings_updated_at<'e, E>(
    executor: E,
    key: &str,
) -> Result<Option<DateTime<Utc>>>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<_, DateTime<Utc>>("SELECT updated_at FROM auth_settings WHERE key = $1")
        .bind(key)
        .fetch_optional(executor)
        .await
        .map_err(map_query_err("fetch settings timestamp"))
}

/// Insert `value` under `key` unless a row already exists.
///
/// Returns `true` when this call created the row.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn insert_settings_if_absent<'e, E>(executor: E, key: &str, value: &Value) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r"
        INSERT INTO auth_settings (key, value)
        VALUES ($1, $2)
        ON CONFLICT (key) DO NOTHING
        ",
    )
    .bind(key)
    .bind(Json(value))
    .execute(executor)
    .await
    .map_err(map_query_err("insert settings"))?;
    Ok(result.rows_affected() == 1)
}

/// Insert or replace the row for `key`, returning the new `updated_at`.
///
/// The timestamp strictly advances past the previous value even when two
/// writes land within the clock's resolution.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn upsert_settings<'e, E>(executor: E, key: &str, value: &Value) -> Result<DateTime<Utc>>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<_, DateTime<Utc>>(
        r"
        INSERT INTO auth_settings (key, value)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET
            value = EXCLUDED.value,
            updated_at = GREATEST(
                clock_timestamp(),
                auth_settings.updated_at + INTERVAL '1 microsecond'
            )
        RETURNING updated_at
        ",
    )
    .bind(key)
    .bind(Json(value))
    .fetch_one(executor)
    .await
    .map_err(map_query_err("upsert settings"))
}
