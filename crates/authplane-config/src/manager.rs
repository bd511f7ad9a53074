//! Single authority over the live configuration.
//!
//! Readers take a lock-free snapshot with [`ConfigManager::config`]. Writers
//! (`load`, `update`) are serialized by an async mutex and publish a complete
//! new snapshot only after it has been validated and persisted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use authplane_data::RUNTIME_CONFIG_KEY;
use authplane_events::CancelToken;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{deep_merge, set_nested_value};
use crate::model::{self, Configuration, preserve_runtime_fields};
use crate::store::{SettingsChanges, SettingsStore};
use crate::validate::validate;

/// Interval between polls when no notification stream is available.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Tuning for [`ConfigManager::watch_with`].
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Delay between polls while notifications are unavailable.
    pub poll_interval: Duration,
    /// Snapshots buffered for a slow consumer.
    pub buffer: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            buffer: 1,
        }
    }
}

/// Cheaply cloneable handle to the live configuration.
#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    key: String,
    store: Arc<dyn SettingsStore>,
    current: ArcSwap<Configuration>,
    writer: Mutex<()>,
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ConfigManager")
            .field("key", &self.inner.key)
            .finish_non_exhaustive()
    }
}

fn to_document(config: &Configuration) -> ConfigResult<Value> {
    serde_json::to_value(config).map_err(|source| ConfigError::Serialization {
        operation: "config.encode",
        source,
    })
}

impl ConfigManager {
    /// Manage `initial` under the `runtime_config` key of `store`.
    #[must_use]
    pub fn new(initial: Configuration, store: Arc<dyn SettingsStore>) -> Self {
        Self::with_key(RUNTIME_CONFIG_KEY, initial, store)
    }

    /// Manage `initial` under an explicit settings key.
    #[must_use]
    pub fn with_key(
        key: impl Into<String>,
        initial: Configuration,
        store: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                key: key.into(),
                store,
                current: ArcSwap::from_pointee(initial),
                writer: Mutex::new(()),
            }),
        }
    }

    /// Current snapshot. Never blocks on writers.
    #[must_use]
    pub fn config(&self) -> Arc<Configuration> {
        self.inner.current.load_full()
    }

    /// Settings key this manager persists under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Seed the settings record from the in-memory configuration, or load
    /// it when another process already did.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable or the stored document
    /// cannot be decoded.
    #[instrument(name = "config_manager.init", skip(self), fields(key = %self.inner.key))]
    pub async fn init(&self) -> ConfigResult<()> {
        let document = to_document(&self.config())?;
        if self
            .inner
            .store
            .insert_if_absent(&self.inner.key, &document)
            .await?
        {
            info!("seeded runtime configuration");
            return Ok(());
        }
        self.load().await
    }

    /// Merge the persisted document over the current snapshot.
    ///
    /// Fields missing from the document keep their current values and every
    /// non-serializable field is carried over unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotInitialized`] when no record exists, or an
    /// error when the store fails or the document cannot be decoded.
    #[instrument(name = "config_manager.load", skip(self), fields(key = %self.inner.key))]
    pub async fn load(&self) -> ConfigResult<()> {
        let _guard = self.inner.writer.lock().await;

        let record = self
            .inner
            .store
            .fetch(&self.inner.key)
            .await?
            .ok_or_else(|| ConfigError::NotInitialized {
                key: self.inner.key.clone(),
            })?;

        let current = self.config();
        let mut document = to_document(&current)?;
        deep_merge(&mut document, record.value);
        let mut next: Configuration =
            serde_json::from_value(document).map_err(|source| ConfigError::Serialization {
                operation: "config.decode",
                source,
            })?;
        preserve_runtime_fields(&mut next, &current);
        self.inner.current.store(Arc::new(next));
        debug!(updated_at = %record.updated_at, "runtime configuration loaded");
        Ok(())
    }

    /// Set `value` at the dot-delimited `key_path`, validate, persist and
    /// publish the result.
    ///
    /// Nothing changes when any step fails.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad path, a value of the wrong shape
    /// or a rule violation, and a store error when persisting fails.
    #[instrument(name = "config_manager.update", skip(self, value), fields(key = %self.inner.key))]
    pub async fn update(&self, key_path: &str, value: Value) -> ConfigResult<Arc<Configuration>> {
        let _guard = self.inner.writer.lock().await;

        let current = self.config();
        let mut document = to_document(&current)?;
        set_nested_value(&mut document, key_path, value)?;
        let mut next: Configuration =
            serde_json::from_value(document).map_err(|source| ConfigError::InvalidField {
                field: key_path.to_string(),
                source,
            })?;
        preserve_runtime_fields(&mut next, &current);
        validate(&next)?;

        let persisted = to_document(&next)?;
        let updated_at = self.inner.store.upsert(&self.inner.key, &persisted).await?;

        let next = Arc::new(next);
        self.inner.current.store(Arc::clone(&next));
        info!(key_path, %updated_at, "runtime configuration updated");
        Ok(next)
    }

    /// Whether moving from `old` to `new` needs the listeners restarted.
    #[must_use]
    pub fn requires_restart(old: &Configuration, new: &Configuration) -> bool {
        model::requires_restart(old, new)
    }

    /// Stream snapshots whenever the persisted record changes, using the
    /// default options.
    #[must_use]
    pub fn watch(&self, cancel: CancelToken) -> mpsc::Receiver<Arc<Configuration>> {
        self.watch_with(cancel, WatchOptions::default())
    }

    /// Stream snapshots whenever the persisted record changes.
    ///
    /// The channel closes once `cancel` fires or the receiver is dropped.
    #[must_use]
    pub fn watch_with(
        &self,
        cancel: CancelToken,
        options: WatchOptions,
    ) -> mpsc::Receiver<Arc<Configuration>> {
        let (sender, receiver) = mpsc::channel(options.buffer.max(1));
        let watcher = Watcher {
            manager: self.clone(),
            poll_interval: options.poll_interval,
            changes: None,
            last_seen: None,
        };
        tokio::spawn(watcher.run(cancel, sender));
        receiver
    }
}

enum Trigger {
    Notified,
    Polled,
}

struct Watcher {
    manager: ConfigManager,
    poll_interval: Duration,
    changes: Option<SettingsChanges>,
    last_seen: Option<DateTime<Utc>>,
}

impl Watcher {
    async fn run(mut self, cancel: CancelToken, sender: mpsc::Sender<Arc<Configuration>>) {
        let key = self.manager.inner.key.clone();
        self.last_seen = match self.manager.inner.store.updated_at(&key).await {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(error = ?err, "failed to read initial settings timestamp");
                None
            }
        };
        self.attach().await;

        loop {
            let trigger = tokio::select! {
                () = cancel.cancelled() => break,
                () = sender.closed() => break,
                trigger = self.next_trigger() => trigger,
            };

            let snapshot = match self.check(&key).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = ?err, "failed to check for configuration changes");
                    continue;
                }
            };

            if matches!(trigger, Trigger::Polled) {
                self.attach().await;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                sent = sender.send(snapshot) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(key = %key, "configuration watch stopped");
    }

    async fn attach(&mut self) {
        if self.changes.is_some() {
            return;
        }
        match self.manager.inner.store.subscribe().await {
            Ok(changes) => self.changes = Some(changes),
            Err(err) => {
                warn!(error = ?err, "settings notifications unavailable; polling");
            }
        }
    }

    async fn next_trigger(&mut self) -> Trigger {
        if let Some(changes) = self.changes.as_mut() {
            match changes.next().await {
                Some(Ok(_)) => return Trigger::Notified,
                Some(Err(err)) => {
                    warn!(error = ?err, "settings notification stream failed; switching to polling");
                }
                None => warn!("settings notification stream closed; switching to polling"),
            }
            self.changes = None;
        }
        sleep(self.poll_interval).await;
        Trigger::Polled
    }

    async fn check(&mut self, key: &str) -> ConfigResult<Option<Arc<Configuration>>> {
        let Some(stamp) = self.manager.inner.store.updated_at(key).await? else {
            return Ok(None);
        };
        if self.last_seen.is_some_and(|seen| stamp <= seen) {
            return Ok(None);
        }
        self.manager.load().await?;
        self.last_seen = Some(stamp);
        Ok(Some(self.manager.config()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use authplane_events::CancelHandle;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::hooks::{AuthUser, Shared, UserHookFn, same_handle};
    use crate::store::MemorySettingsStore;

    fn base_config() -> Configuration {
        let hook: Shared<UserHookFn> = Shared::from_arc(Arc::new(|_: &AuthUser| Ok(())));
        let mut config = Configuration {
            secret: "s3cret".into(),
            ..Configuration::default()
        };
        config.event_hooks.on_user_logged_in = Some(hook);
        config
    }

    fn manager_with(store: Arc<dyn SettingsStore>) -> ConfigManager {
        ConfigManager::new(base_config(), store)
    }

    #[tokio::test]
    async fn init_seeds_then_loads() {
        let store = Arc::new(MemorySettingsStore::new());
        let first = manager_with(store.clone());
        first.init().await.expect("init");
        first.init().await.expect("idempotent init");
        assert!(store.fetch(RUNTIME_CONFIG_KEY).await.expect("fetch").is_some());

        store
            .upsert(RUNTIME_CONFIG_KEY, &json!({"app_name": "Stored"}))
            .await
            .expect("upsert");
        let second = manager_with(store);
        second.init().await.expect("init loads");
        assert_eq!(second.config().app_name, "Stored");
        assert_eq!(second.config().base_path, "/auth");
    }

    #[tokio::test]
    async fn load_without_record_is_not_initialized() {
        let manager = manager_with(Arc::new(MemorySettingsStore::new()));
        let err = manager.load().await.expect_err("no record");
        assert!(matches!(err, ConfigError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn load_twice_is_idempotent() {
        let store = Arc::new(MemorySettingsStore::new());
        store
            .insert_if_absent(RUNTIME_CONFIG_KEY, &json!({"rate_limit": {"max": 7}}))
            .await
            .expect("seed");
        let manager = manager_with(store);
        manager.load().await.expect("load");
        let first = serde_json::to_value(&*manager.config()).expect("encode");
        manager.load().await.expect("load again");
        let second = serde_json::to_value(&*manager.config()).expect("encode");
        assert_eq!(first, second);
        assert_eq!(manager.config().rate_limit.max, 7);
    }

    #[tokio::test]
    async fn update_applies_value_and_keeps_runtime_fields() {
        let store = Arc::new(MemorySettingsStore::new());
        let manager = manager_with(store.clone());
        manager.init().await.expect("init");
        let before = manager.config();

        let after = manager
            .update("rate_limit.max", json!(5))
            .await
            .expect("update");
        assert_eq!(after.rate_limit.max, 5);
        assert_eq!(manager.config().rate_limit.max, 5);
        assert!(same_handle(
            manager.config().event_hooks.on_user_logged_in.as_ref(),
            before.event_hooks.on_user_logged_in.as_ref()
        ));

        let stored = store
            .fetch(RUNTIME_CONFIG_KEY)
            .await
            .expect("fetch")
            .expect("record");
        assert_eq!(stored.value["rate_limit"]["max"], json!(5));
    }

    #[tokio::test]
    async fn failed_update_changes_nothing() {
        let store = Arc::new(MemorySettingsStore::new());
        let manager = manager_with(store.clone());
        manager.init().await.expect("init");
        let stamp = store.updated_at(RUNTIME_CONFIG_KEY).await.expect("stamp");

        let err = manager
            .update("base_path", json!("no-slash"))
            .await
            .expect_err("invalid");
        assert!(err.is_validation());

        let err = manager
            .update("rate_limit.max", json!("many"))
            .await
            .expect_err("wrong shape");
        assert!(matches!(err, ConfigError::InvalidField { .. }));

        let err = manager.update("", json!(1)).await.expect_err("empty path");
        assert!(err.is_validation());

        assert_eq!(manager.config().base_path, "/auth");
        assert_eq!(
            store.updated_at(RUNTIME_CONFIG_KEY).await.expect("stamp"),
            stamp
        );
    }

    #[tokio::test]
    async fn concurrent_updates_are_serialized() {
        let manager = manager_with(Arc::new(MemorySettingsStore::new()));
        manager.init().await.expect("init");

        let mut tasks = Vec::new();
        for index in 1..=10_u64 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .update(&format!("rate_limit.custom_rules./r{index}"), json!({"max": index}))
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("update");
        }
        assert_eq!(manager.config().rate_limit.custom_rules.len(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_block_or_see_partial_snapshots() {
        let manager = manager_with(Arc::new(MemorySettingsStore::new()));
        manager.init().await.expect("init");
        manager
            .update(
                "email_password",
                json!({"min_password_length": 1, "max_password_length": 101}),
            )
            .await
            .expect("seed bounds");

        {
            let _writer = manager.inner.writer.lock().await;
            let snapshot = timeout(Duration::from_millis(100), async { manager.config() })
                .await
                .expect("reads do not wait for the writer");
            assert_eq!(snapshot.email_password.min_password_length, 1);
        }

        let stop = CancelHandle::new();
        let mut readers = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let token = stop.token();
            readers.push(tokio::spawn(async move {
                let mut reads = 0_u64;
                while !token.is_cancelled() {
                    let snapshot = manager.config();
                    let bounds = &snapshot.email_password;
                    assert_eq!(
                        bounds.max_password_length,
                        bounds.min_password_length + 100
                    );
                    assert!(snapshot.event_hooks.on_user_logged_in.is_some());
                    reads += 1;
                    tokio::task::yield_now().await;
                }
                reads
            }));
        }

        for min in 2..=40_u32 {
            manager
                .update(
                    "email_password",
                    json!({"min_password_length": min, "max_password_length": min + 100}),
                )
                .await
                .expect("update");
            if min % 10 == 0 {
                manager.load().await.expect("load");
            }
        }
        stop.cancel();

        for reader in readers {
            assert!(reader.await.expect("reader") > 0);
        }
        assert_eq!(manager.config().email_password.min_password_length, 40);
    }

    #[tokio::test]
    async fn cancel_stops_a_watch_blocked_on_a_full_buffer() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        let local = manager_with(store.clone());
        local.init().await.expect("init");
        let remote = manager_with(store);

        let cancel = CancelHandle::new();
        let mut changes = local.watch_with(
            cancel.token(),
            WatchOptions {
                poll_interval: Duration::from_millis(10),
                buffer: 1,
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        for index in 0..3 {
            remote
                .update("app_name", json!(format!("Renamed {index}")))
                .await
                .expect("remote update");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        cancel.cancel();
        timeout(Duration::from_secs(2), async {
            while changes.recv().await.is_some() {}
        })
        .await
        .expect("watch closes after cancel");
    }

    async fn watch_sees_foreign_update(store: Arc<dyn SettingsStore>) {
        let local = manager_with(store.clone());
        local.init().await.expect("init");
        let remote = manager_with(store);

        let cancel = CancelHandle::new();
        let mut changes = local.watch_with(
            cancel.token(),
            WatchOptions {
                poll_interval: Duration::from_millis(20),
                buffer: 1,
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        remote
            .update("app_name", json!("Renamed"))
            .await
            .expect("remote update");

        let snapshot = timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("snapshot in time")
            .expect("channel open");
        assert_eq!(snapshot.app_name, "Renamed");
        assert_eq!(local.config().app_name, "Renamed");
        assert!(local.config().event_hooks.on_user_logged_in.is_some());

        cancel.cancel();
        let closed = timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("closes in time");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn watch_uses_notifications() {
        watch_sees_foreign_update(Arc::new(MemorySettingsStore::new())).await;
    }

    #[tokio::test]
    async fn watch_falls_back_to_polling() {
        watch_sees_foreign_update(Arc::new(MemorySettingsStore::without_notifications())).await;
    }

    #[test]
    fn restart_decision_delegates_to_model() {
        let old = Configuration::default();
        let mut new = old.clone();
        assert!(!ConfigManager::requires_restart(&old, &new));
        new.base_url = "https://example.com".into();
        assert!(ConfigManager::requires_restart(&old, &new));
    }
}
