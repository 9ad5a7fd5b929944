//! TTL key-value store backing locks, pending markers, status records and the
//! short-lived idempotency guards.

mod clock;
mod memory;
mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use sqlite::{SqliteKvStore, SqliteKvStoreBuilder};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open cache database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("cache statement failed: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("cache path not configured")]
    MissingStore,
    #[error("cache value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache lock poisoned")]
    Poisoned,
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Minimal contract every backend provides. `add` must be atomic: it is the
/// only primitive mutual exclusion is built on.
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> CacheResult<Option<String>>;

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Stores `value` only when `key` is absent or expired. Returns whether the
    /// value was written.
    fn add(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    fn delete(&self, key: &str) -> CacheResult<()>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

pub(crate) fn expiry_millis(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
