use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{expiry_millis, CacheError, CacheResult, Clock, KeyValueStore, SystemClock};
use crate::sqlite::SqliteTarget;

const CACHE_SCHEMA: &str = include_str!("../../../sql/cache.sql");

#[derive(Debug)]
pub struct SqliteKvStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
    clock: Arc<dyn Clock>,
}

impl Default for SqliteKvStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
            clock: Arc::new(SystemClock),
        }
    }
}

impl SqliteKvStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the database and applies the schema, so a built store is usable
    /// immediately.
    pub fn build(self) -> CacheResult<SqliteKvStore> {
        let path = self.path.ok_or(CacheError::MissingStore)?;
        let store = SqliteKvStore {
            target: SqliteTarget::new(&path, false, self.create_if_missing),
            clock: self.clock,
        };
        store.initialize()?;
        Ok(store)
    }
}

/// Key-value store shared by every process pointing at the same file. `add`
/// takes the database write lock up front (`BEGIN IMMEDIATE`) so two workers
/// racing on a lock key serialise on SQLite rather than on process memory.
#[derive(Debug)]
pub struct SqliteKvStore {
    target: SqliteTarget,
    clock: Arc<dyn Clock>,
}

impl SqliteKvStore {
    pub fn builder() -> SqliteKvStoreBuilder {
        SqliteKvStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CacheResult<Self> {
        SqliteKvStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        self.target.path()
    }

    fn open(&self) -> CacheResult<Connection> {
        self.target.open().map_err(|source| CacheError::Open {
            source,
            path: self.target.path().to_path_buf(),
        })
    }

    fn initialize(&self) -> CacheResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(())
    }

    /// Drops every expired row. Expired rows are already invisible to readers;
    /// this only reclaims space.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at_ms <= ?1",
            params![self.clock.now_millis()],
        )?;
        Ok(removed)
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, self.clock.now_millis()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO cache_entries (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
            params![key, value, expiry_millis(self.clock.now_millis(), ttl)],
        )?;
        Ok(())
    }

    fn add(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.open()?;
        let now = self.clock.now_millis();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM cache_entries WHERE key = ?1 AND expires_at_ms <= ?2",
            params![key, now],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO cache_entries (key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
            params![key, value, expiry_millis(now, ttl)],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(())
    }
}
