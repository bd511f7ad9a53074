//! Key/value rows backing database secondary storage.
//!
//! Expired rows are invisible to reads and are reset by increments; a
//! periodic sweep removes them physically via [`delete_expired`].

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};
use tracing::debug;

use crate::error::{Result, map_query_err};

/// Fetch the live value for `key`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn fetch_value<'e, E>(executor: E, key: &str) -> Result<Option<String>>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<_, String>(
        r"
        SELECT value FROM key_value_store
        WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())
        ",
    )
    .bind(key)
    .fetch_optional(executor)
    .await
    .map_err(map_query_err("fetch key value"))
}

/// Insert or replace `key`, resetting its expiry to `expires_at`.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn upsert_value<'e, E>(
    executor: E,
    key: &str,
    value: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r"
        INSERT INTO key_value_store (key, value, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (key) DO UPDATE SET
            value = EXCLUDED.value,
            expires_at = EXCLUDED.expires_at,
            updated_at = now()
        ",
    )
    .bind(key)
    .bind(value)
    .bind(expires_at)
    .execute(executor)
    .await
    .map_err(map_query_err("upsert key value"))?;
    Ok(())
}

/// Delete `key`. Returns `true` when a live row was removed.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn delete_value<'e, E>(executor: E, key: &str) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r"
        DELETE FROM key_value_store
        WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())
        ",
    )
    .bind(key)
    .execute(executor)
    .await
    .map_err(map_query_err("delete key value"))?;
    Ok(result.rows_affected() > 0)
}

/// Atomically increment the integer counter stored at `key`.
///
/// A missing or expired counter restarts at `1` with `expires_at`; a live
/// counter keeps its original expiry.
///
/// # Errors
///
/// Returns an error if the statement fails, including when the stored
/// value is not an integer.
pub async fn increment_counter<'e, E>(
    executor: E,
    key: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<i64>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO key_value_store (key, value, expires_at)
        VALUES ($1, '1', $2)
        ON CONFLICT (key) DO UPDATE SET
            value = CASE
                WHEN key_value_store.expires_at IS NOT NULL
                     AND key_value_store.expires_at <= now() THEN '1'
                ELSE (key_value_store.value::BIGINT + 1)::TEXT
            END,
            expires_at = CASE
                WHEN key_value_store.expires_at IS NOT NULL
                     AND key_value_store.expires_at <= now() THEN EXCLUDED.expires_at
                ELSE key_value_store.expires_at
            END,
            updated_at = now()
        RETURNING value::BIGINT
        ",
    )
    .bind(key)
    .bind(expires_at)
    .fetch_one(executor)
    .await
    .map_err(map_query_err("increment counter"))
}

/// Remove every row whose expiry has passed. Returns the number removed.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn delete_expired<'e, E>(executor: E) -> Result<u64>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM key_value_store WHERE expires_at < now()")
        .execute(executor)
        .await
        .map_err(map_query_err("delete expired key values"))?;
    let removed = result.rows_affected();
    if removed > 0 {
        debug!(removed, "removed expired key/value rows");
    }
    Ok(removed)
}
