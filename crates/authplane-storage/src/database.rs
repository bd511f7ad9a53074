//! Secondary storage backed by the `key_value_store` table.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use authplane_data::kv;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::{DEFAULT_CLEANUP_INTERVAL, SecondaryStorage, effective_ttl};

/// Options for [`DatabaseStorage::start`].
#[derive(Debug, Clone, Copy)]
pub struct DatabaseStorageOptions {
    /// Interval between `DELETE ... WHERE expires_at < now()` sweeps.
    pub cleanup_interval: Duration,
}

impl Default for DatabaseStorageOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// `PostgreSQL`-backed [`SecondaryStorage`].
#[derive(Debug)]
pub struct DatabaseStorage {
    pool: PgPool,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseStorage {
    /// Wrap `pool` without a cleanup task.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cleanup: Mutex::new(None),
        }
    }

    /// Wrap `pool` and spawn the periodic expiry sweep.
    #[must_use]
    pub fn start(pool: PgPool, options: DatabaseStorageOptions) -> Arc<Self> {
        let storage = Arc::new(Self::new(pool));
        let weak = Arc::downgrade(&storage);
        let period = if options.cleanup_interval.is_zero() {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            options.cleanup_interval
        };
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(storage) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = storage.purge_expired().await {
                    warn!(error = ?err, "failed to purge expired key/value rows");
                }
            }
            debug!("database storage cleanup stopped");
        });
        *storage.lock_cleanup() = Some(handle);
        storage
    }

    /// Delete expired rows now, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete statement fails.
    pub async fn purge_expired(&self) -> StorageResult<u64> {
        kv::delete_expired(&self.pool)
            .await
            .map_err(|source| StorageError::database("kv.delete_expired", source))
    }

    /// Stop the cleanup task, if one is running.
    pub fn close(&self) {
        if let Some(handle) = self.lock_cleanup().take() {
            handle.abort();
        }
    }

    fn lock_cleanup(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.cleanup.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DatabaseStorage {
    fn drop(&mut self) {
        self.close();
    }
}

fn deadline(ttl: Option<Duration>) -> StorageResult<Option<DateTime<Utc>>> {
    effective_ttl(ttl)
        .map(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|offset| Utc::now().checked_add_signed(offset))
                .ok_or(StorageError::InvalidTtl {
                    millis: ttl.as_millis(),
                })
        })
        .transpose()
}

#[async_trait]
impl SecondaryStorage for DatabaseStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        kv::fetch_value(&self.pool, key)
            .await
            .map_err(|source| StorageError::database("kv.fetch_value", source))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        let expires_at = deadline(ttl)?;
        kv::upsert_value(&self.pool, key, value, expires_at)
            .await
            .map_err(|source| StorageError::database("kv.upsert_value", source))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let removed = kv::delete_value(&self.pool, key)
            .await
            .map_err(|source| StorageError::database("kv.delete_value", source))?;
        if removed {
            Ok(())
        } else {
            Err(StorageError::NotFound {
                key: key.to_string(),
            })
        }
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StorageResult<i64> {
        let expires_at = deadline(ttl)?;
        kv::increment_counter(&self.pool, key, expires_at)
            .await
            .map_err(|source| StorageError::database("kv.increment_counter", source))
    }
}
