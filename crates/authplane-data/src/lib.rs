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

//! Shared data access layer for Authplane: migrations, the runtime settings
//! row, key/value rows backing database secondary storage, and the plugin
//! migration ledger.

pub mod error;
pub mod kv;
pub mod plugins;
pub mod settings;

pub use error::{DataError, Result as DataResult};
pub use settings::{RUNTIME_CONFIG_KEY, SETTINGS_CHANNEL, SettingsRow};

use sqlx::PgPool;

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns an error when migration execution fails.
pub async fn run_migrations(pool: &PgPool) -> DataResult<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|source| DataError::MigrationFailed { source })?;
    Ok(())
}
