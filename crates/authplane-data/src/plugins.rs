//! Ledger of SQL migrations contributed by plugins.

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Result, map_query_err};

/// Apply `sql` for `(plugin, name)` unless it already ran.
///
/// The script and its ledger entry commit in one transaction. Returns
/// `true` when the script executed.
///
/// # Errors
///
/// Returns an error if the ledger lookup, the script, or the commit fails.
pub async fn apply_plugin_migration(
    pool: &PgPool,
    plugin: &str,
    name: &str,
    sql: &str,
) -> Result<bool> {
    let mut tx: Transaction<'_, Postgres> = pool
        .begin()
        .await
        .map_err(map_query_err("begin plugin migration"))?;

    let claimed = sqlx::query(
        r"
        INSERT INTO plugin_migrations (plugin, name)
        VALUES ($1, $2)
        ON CONFLICT (plugin, name) DO NOTHING
        ",
    )
    .bind(plugin)
    .bind(name)
    .execute(tx.as_mut())
    .await
    .map_err(map_query_err("record plugin migration"))?
    .rows_affected()
        == 1;

    if !claimed {
        tx.rollback()
            .await
            .map_err(map_query_err("rollback plugin migration"))?;
        return Ok(false);
    }

    sqlx::raw_sql(sqlx::AssertSqlSafe(sql))
        .execute(tx.as_mut())
        .await
        .map_err(map_query_err("execute plugin migration"))?;

    tx.commit()
        .await
        .map_err(map_query_err("commit plugin migration"))?;
    Ok(true)
}
