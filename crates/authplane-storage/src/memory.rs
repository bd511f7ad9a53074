//! In-process secondary storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::{DEFAULT_CLEANUP_INTERVAL, SecondaryStorage, effective_ttl};

/// Options for [`MemoryStorage::start`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryStorageOptions {
    /// Interval between sweeps of expired entries.
    pub cleanup_interval: Duration,
}

impl Default for MemoryStorageOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Hash map guarded by a mutex. Expired entries are hidden from reads
/// immediately and removed by the sweep task.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStorage {
    /// Create a store without a background sweep.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store and spawn its sweep task on the current runtime.
    ///
    /// The task holds a weak reference and exits once the store is dropped.
    #[must_use]
    pub fn start(options: MemoryStorageOptions) -> Arc<Self> {
        let storage = Arc::new(Self::new());
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
                let removed = storage.purge_expired();
                if removed > 0 {
                    debug!(removed, "purged expired memory storage entries");
                }
            }
        });
        *storage.lock_sweeper() = Some(handle);
        storage
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of entries currently held, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sweep task, if one is running.
    pub fn close(&self) {
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.close();
    }
}

fn deadline(now: Instant, ttl: Option<Duration>) -> StorageResult<Option<Instant>> {
    effective_ttl(ttl)
        .map(|ttl| {
            now.checked_add(ttl).ok_or(StorageError::InvalidTtl {
                millis: ttl.as_millis(),
            })
        })
        .transpose()
}

#[async_trait]
impl SecondaryStorage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .lock_entries()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        let expires_at = deadline(Instant::now(), ttl)?;
        self.lock_entries().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let now = Instant::now();
        match self.lock_entries().remove(key) {
            Some(entry) if entry.is_live(now) => Ok(()),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StorageResult<i64> {
        let now = Instant::now();
        let expires_at = deadline(now, ttl)?;
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(key)
            && entry.is_live(now)
        {
            let current: i64 = entry
                .value
                .parse()
                .map_err(|_| StorageError::InvalidValue {
                    key: key.to_string(),
                    value: entry.value.clone(),
                })?;
            let next = current.saturating_add(1);
            entry.value = next.to_string();
            return Ok(next);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: "1".to_string(),
                expires_at,
            },
        );
        Ok(1)
    }
}
