//! Persistence backends for the runtime settings record.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use authplane_data::settings::{self as data_settings, SettingsRow};
use authplane_data::{DataError, SETTINGS_CHANNEL};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Stored configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsRecord {
    /// Settings key.
    pub key: String,
    /// JSON document.
    pub value: Value,
    /// First insert time.
    pub created_at: DateTime<Utc>,
    /// Last write time; advances on every write.
    pub updated_at: DateTime<Utc>,
}

impl From<SettingsRow> for SettingsRecord {
    fn from(row: SettingsRow) -> Self {
        Self {
            key: row.key,
            value: row.value.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Stream of changed settings keys.
pub type SettingsChanges = Pin<Box<dyn Stream<Item = ConfigResult<String>> + Send>>;

/// Backend holding settings records.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fetch a record.
    async fn fetch(&self, key: &str) -> ConfigResult<Option<SettingsRecord>>;

    /// Fetch only the change marker of a record.
    async fn updated_at(&self, key: &str) -> ConfigResult<Option<DateTime<Utc>>>;

    /// Insert unless a record already exists; returns whether it inserted.
    async fn insert_if_absent(&self, key: &str, value: &Value) -> ConfigResult<bool>;

    /// Insert or replace, returning the new change marker.
    async fn upsert(&self, key: &str, value: &Value) -> ConfigResult<DateTime<Utc>>;

    /// Subscribe to change notifications.
    ///
    /// Stores without a native notification mechanism return an error and
    /// callers fall back to polling [`SettingsStore::updated_at`].
    async fn subscribe(&self) -> ConfigResult<SettingsChanges>;
}

/// `auth_settings` table with `LISTEN`/`NOTIFY` change notifications.
#[derive(Debug, Clone)]
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    /// Wrap an existing pool. Migrations must already be applied.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn store_err(operation: &'static str) -> impl Fn(DataError) -> ConfigError {
    move |source| ConfigError::Store { operation, source }
}

fn listen_err(source: sqlx::Error) -> ConfigError {
    ConfigError::Store {
        operation: "settings.listen",
        source: DataError::QueryFailed {
            operation: "settings.listen",
            source,
        },
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn fetch(&self, key: &str) -> ConfigResult<Option<SettingsRecord>> {
        data_settings::fetch_settings(&self.pool, key)
            .await
            .map(|row| row.map(SettingsRecord::from))
            .map_err(store_err("settings.fetch"))
    }

    async fn updated_at(&self, key: &str) -> ConfigResult<Option<DateTime<Utc>>> {
        data_settings::fetch_settings_updated_at(&self.pool, key)
            .await
            .map_err(store_err("settings.updated_at"))
    }

    async fn insert_if_absent(&self, key: &str, value: &Value) -> ConfigResult<bool> {
        data_settings::insert_settings_if_absent(&self.pool, key, value)
            .await
            .map_err(store_err("settings.insert_if_absent"))
    }

    async fn upsert(&self, key: &str, value: &Value) -> ConfigResult<DateTime<Utc>> {
        data_settings::upsert_settings(&self.pool, key, value)
            .await
            .map_err(store_err("settings.upsert"))
    }

    async fn subscribe(&self) -> ConfigResult<SettingsChanges> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(listen_err)?;
        listener.listen(SETTINGS_CHANNEL).await.map_err(listen_err)?;
        debug!(channel = SETTINGS_CHANNEL, "listening for settings changes");

        let stream = listener.into_stream().map(|item| {
            item.map(|notification| notification.payload().to_string())
                .map_err(listen_err)
        });
        Ok(Box::pin(stream))
    }
}

/// In-process store used by tests and library mode.
#[derive(Debug)]
pub struct MemorySettingsStore {
    records: Mutex<HashMap<String, SettingsRecord>>,
    changes: Option<broadcast::Sender<String>>,
}

impl MemorySettingsStore {
    /// Store that announces every write to subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            records: Mutex::new(HashMap::new()),
            changes: Some(sender),
        }
    }

    /// Store without notifications, forcing watchers onto polling.
    #[must_use]
    pub fn without_notifications() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            changes: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SettingsRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, key: &str) {
        if let Some(sender) = &self.changes {
            let _ = sender.send(key.to_string());
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn next_stamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if previous >= now => previous + chrono::Duration::microseconds(1),
        _ => now,
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn fetch(&self, key: &str) -> ConfigResult<Option<SettingsRecord>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn updated_at(&self, key: &str) -> ConfigResult<Option<DateTime<Utc>>> {
        Ok(self.lock().get(key).map(|record| record.updated_at))
    }

    async fn insert_if_absent(&self, key: &str, value: &Value) -> ConfigResult<bool> {
        let inserted = {
            let mut records = self.lock();
            if records.contains_key(key) {
                false
            } else {
                let now = Utc::now();
                records.insert(
                    key.to_string(),
                    SettingsRecord {
                        key: key.to_string(),
                        value: value.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                true
            }
        };
        if inserted {
            self.announce(key);
        }
        Ok(inserted)
    }

    async fn upsert(&self, key: &str, value: &Value) -> ConfigResult<DateTime<Utc>> {
        let stamp = {
            let mut records = self.lock();
            let previous = records.get(key);
            let stamp = next_stamp(previous.map(|record| record.updated_at));
            let created_at = previous.map_or(stamp, |record| record.created_at);
            records.insert(
                key.to_string(),
                SettingsRecord {
                    key: key.to_string(),
                    value: value.clone(),
                    created_at,
                    updated_at: stamp,
                },
            );
            stamp
        };
        self.announce(key);
        Ok(stamp)
    }

    async fn subscribe(&self) -> ConfigResult<SettingsChanges> {
        let Some(sender) = &self.changes else {
            return Err(ConfigError::Unsupported {
                operation: "settings.subscribe",
            });
        };
        // A lagged receiver only means changes were coalesced; the watcher
        // re-reads `updated_at` either way.
        let stream = BroadcastStream::new(sender.subscribe()).map(|item| {
            Ok(item.unwrap_or_else(|_| String::new()))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_inserts_once_and_advances_stamp() {
        let store = MemorySettingsStore::new();
        assert!(store.fetch("k").await.expect("fetch").is_none());

        assert!(store.insert_if_absent("k", &json!({"a": 1})).await.expect("insert"));
        assert!(!store.insert_if_absent("k", &json!({"a": 2})).await.expect("insert"));
        let first = store.fetch("k").await.expect("fetch").expect("record");
        assert_eq!(first.value, json!({"a": 1}));

        let second = store.upsert("k", &json!({"a": 3})).await.expect("upsert");
        let third = store.upsert("k", &json!({"a": 4})).await.expect("upsert");
        assert!(second > first.updated_at);
        assert!(third > second);
        assert_eq!(store.updated_at("k").await.expect("stamp"), Some(third));

        let record = store.fetch("k").await.expect("fetch").expect("record");
        assert_eq!(record.created_at, first.created_at);
    }

    #[tokio::test]
    async fn memory_store_notifies_subscribers() {
        let store = MemorySettingsStore::new();
        let mut changes = store.subscribe().await.expect("subscribe");
        store.upsert("runtime_config", &json!({})).await.expect("upsert");
        let key = changes.next().await.expect("item").expect("ok");
        assert_eq!(key, "runtime_config");
    }

    #[tokio::test]
    async fn memory_store_without_notifications_refuses_subscribe() {
        let store = MemorySettingsStore::without_notifications();
        assert!(store.subscribe().await.is_err());
    }
}
