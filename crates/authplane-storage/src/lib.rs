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

//! Secondary key/value storage.
//!
//! Layout: `memory.rs` (in-process map with a sweep task), `database.rs`
//! (`key_value_store` rows with a cleanup task), `error.rs`.

pub mod database;
pub mod error;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use database::{DatabaseStorage, DatabaseStorageOptions};
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryStorage, MemoryStorageOptions};

/// Default interval between expiry sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Abstract key/value store shared by the rate limiter and caches.
///
/// Expiry is fixed-window: a TTL applies when a key is written by
/// [`SecondaryStorage::set`] or created by [`SecondaryStorage::increment`],
/// and later increments do not extend it. A zero TTL means no expiry.
#[async_trait]
pub trait SecondaryStorage: Send + Sync {
    /// Fetch the live value for `key`.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()>;

    /// Remove `key`.
    ///
    /// Fails with [`StorageError::NotFound`] when no live value exists.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Atomically add one to the integer stored at `key` and return the new
    /// count. A missing or expired key starts at `1` with `ttl` applied.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StorageResult<i64>;
}

pub(crate) fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|ttl| !ttl.is_zero())
}
