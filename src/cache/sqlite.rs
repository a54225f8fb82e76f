//! SQLite-backed cache store. The database file may be shared by several
//! gateway processes; SQLite's own locking serializes writers.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::store::{expiry, CacheEntry, CacheStore, FlushConfirmation};
use crate::error::StoreError;

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(expires_at);
"#;

pub struct SqliteStore {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
}

impl SqliteStore {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Unavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Unavailable(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| StoreError::Unavailable(format!("Failed to set busy timeout: {}", e)))?;
    conn
      .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
      .map_err(|e| StoreError::Unavailable(format!("Failed to enable WAL: {}", e)))?;

    Self::from_connection(conn)
  }

  /// Private, throwaway database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StoreError::Unavailable(format!("Failed to open in-memory cache: {}", e)))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    let store = Self {
      conn: Mutex::new(conn),
      clock: Arc::new(SystemClock),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Replace the time source used for expiry.
  #[cfg(test)]
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Default database location under the user's data directory.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("cachegate").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| StoreError::Unavailable(format!("Failed to run cache migrations: {}", e)))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("Lock poisoned: {}", e)))
  }
}

impl CacheStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let now = self.clock.now();
    let conn = self.lock()?;

    // Expiry is enforced here, not by purge_expired
    let row: Option<(Vec<u8>, i64, i64)> = conn
      .query_row(
        "SELECT value, created_at, expires_at FROM cache_entries
         WHERE key = ? AND expires_at > ?",
        params![key, now.timestamp_millis()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| StoreError::Unavailable(format!("Failed to read {}: {}", key, e)))?;

    match row {
      Some((value, created_at, expires_at)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        value,
        created_at: from_millis(created_at)?,
        expires_at: from_millis(expires_at)?,
      })),
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
    let now = self.clock.now();
    let expires_at = expiry(now, ttl);

    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, value, created_at, expires_at)
         VALUES (?, ?, ?, ?)",
        params![
          key,
          value,
          now.timestamp_millis(),
          expires_at.timestamp_millis()
        ],
      )
      .map_err(|e| StoreError::Unavailable(format!("Failed to store {}: {}", key, e)))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self
      .lock()?
      .execute("DELETE FROM cache_entries WHERE key = ?", params![key])
      .map_err(|e| StoreError::Unavailable(format!("Failed to delete {}: {}", key, e)))?;
    Ok(())
  }

  fn flush_all(&self, _confirm: FlushConfirmation) -> Result<(), StoreError> {
    self
      .lock()?
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| StoreError::Unavailable(format!("Failed to flush cache: {}", e)))?;
    Ok(())
  }

  fn ping(&self) -> Result<(), StoreError> {
    self
      .lock()?
      .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
      .map(|_| ())
      .map_err(|e| StoreError::Unavailable(format!("Cache ping failed: {}", e)))
  }

  fn len(&self) -> Result<usize, StoreError> {
    let now = self.clock.now();
    let count: i64 = self
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE expires_at > ?",
        params![now.timestamp_millis()],
        |row| row.get(0),
      )
      .map_err(|e| StoreError::Unavailable(format!("Failed to count entries: {}", e)))?;
    Ok(count.max(0) as usize)
  }

  fn purge_expired(&self) -> Result<usize, StoreError> {
    let now = self.clock.now();
    self
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE expires_at <= ?",
        params![now.timestamp_millis()],
      )
      .map_err(|e| StoreError::Unavailable(format!("Failed to purge expired entries: {}", e)))
  }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
  DateTime::from_timestamp_millis(millis)
    .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", millis)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use chrono::TimeDelta;

  fn store() -> (SqliteStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let store = SqliteStore::open_in_memory()
      .unwrap()
      .with_clock(clock.clone());
    (store, clock)
  }

  #[test]
  fn test_roundtrip_until_expiry() {
    let (store, clock) = store();
    store.set("pos:weather:abc", b"{\"temp\":12.5}", Duration::from_secs(300)).unwrap();

    clock.advance(TimeDelta::seconds(10));
    let entry = store.get("pos:weather:abc").unwrap().unwrap();
    assert_eq!(entry.value, b"{\"temp\":12.5}");

    clock.advance(TimeDelta::seconds(290));
    assert!(store.get("pos:weather:abc").unwrap().is_none());
  }

  #[test]
  fn test_expired_row_hidden_before_purge() {
    let (store, clock) = store();
    store.set("k", b"v", Duration::from_secs(1)).unwrap();
    clock.advance(TimeDelta::seconds(2));

    assert!(store.get("k").unwrap().is_none());
    assert_eq!(store.len().unwrap(), 0);
    assert_eq!(store.purge_expired().unwrap(), 1);
  }

  #[test]
  fn test_last_write_wins() {
    let (store, _) = store();
    store.set("k", b"first", Duration::from_secs(60)).unwrap();
    store.set("k", b"second", Duration::from_secs(60)).unwrap();
    assert_eq!(store.get("k").unwrap().unwrap().value, b"second");
    assert_eq!(store.len().unwrap(), 1);
  }

  #[test]
  fn test_delete_and_flush() {
    let (store, _) = store();
    store.set("a", b"1", Duration::from_secs(60)).unwrap();
    store.set("b", b"2", Duration::from_secs(60)).unwrap();

    store.delete("a").unwrap();
    store.delete("a").unwrap();
    assert!(store.get("a").unwrap().is_none());

    store.flush_all(FlushConfirmation::destroy_every_entry()).unwrap();
    assert_eq!(store.len().unwrap(), 0);
    assert!(store.get("b").unwrap().is_none());
  }

  #[test]
  fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.ping().unwrap();
      store.set("k", b"persisted", Duration::from_secs(60)).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get("k").unwrap().unwrap().value, b"persisted");
  }

  #[test]
  fn test_unopenable_path_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the database file should be
    let err = SqliteStore::open(dir.path()).err().unwrap();
    assert!(matches!(err, StoreError::Unavailable(_)));
  }
}
