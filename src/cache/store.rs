//! Cache store trait plus the in-process implementations.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// A live entry as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  /// Serialized payload; the store never looks inside
  pub value: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  pub(crate) fn new(key: &str, value: &[u8], now: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      key: key.to_string(),
      value: value.to_vec(),
      created_at: now,
      expires_at: expiry(now, ttl),
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

/// `now + ttl`, saturating instead of overflowing on absurd TTLs.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  TimeDelta::from_std(ttl)
    .ok()
    .and_then(|ttl| now.checked_add_signed(ttl))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Proof that the caller really means to wipe every entry.
///
/// `flush_all` cannot be reached without one of these, and the only way to get
/// one is the loudly named constructor below.
#[derive(Debug)]
pub struct FlushConfirmation(());

impl FlushConfirmation {
  /// DANGER: the returned token lets `flush_all` destroy the whole store.
  pub fn destroy_every_entry() -> Self {
    Self(())
  }
}

/// Key/value store with per-entry expiry.
///
/// Implementations must be safe to share between tasks without outside
/// locking. Concurrent `set`s on one key are last-write-wins.
pub trait CacheStore: Send + Sync {
  /// Live entry for `key`. Expired entries are reported absent even if they
  /// have not been reclaimed yet.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

  /// Store `value`, replacing whatever was there, expiring at `now + ttl`.
  fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

  /// Remove `key`. Absent keys are fine.
  fn delete(&self, key: &str) -> Result<(), StoreError>;

  /// DANGER: irreversibly destroys every entry in the store.
  fn flush_all(&self, confirm: FlushConfirmation) -> Result<(), StoreError>;

  /// Connectivity check for startup.
  fn ping(&self) -> Result<(), StoreError>;

  /// Number of live entries.
  fn len(&self) -> Result<usize, StoreError>;

  /// Reclaim storage held by expired entries. Returns how many were dropped.
  fn purge_expired(&self) -> Result<usize, StoreError> {
    Ok(0)
  }
}

impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
    (**self).set(key, value, ttl)
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    (**self).delete(key)
  }

  fn flush_all(&self, confirm: FlushConfirmation) -> Result<(), StoreError> {
    (**self).flush_all(confirm)
  }

  fn ping(&self) -> Result<(), StoreError> {
    (**self).ping()
  }

  fn len(&self) -> Result<usize, StoreError> {
    (**self).len()
  }

  fn purge_expired(&self) -> Result<usize, StoreError> {
    (**self).purge_expired()
  }
}

/// Store that keeps nothing. Used when the real backend cannot be reached,
/// so every fetch goes live.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StoreError> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<(), StoreError> {
    Ok(())
  }

  fn flush_all(&self, _confirm: FlushConfirmation) -> Result<(), StoreError> {
    Ok(())
  }

  fn ping(&self) -> Result<(), StoreError> {
    Ok(())
  }

  fn len(&self) -> Result<usize, StoreError> {
    Ok(0)
  }
}

/// Process-local store backed by a mutex-guarded map.
pub struct MemoryStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
  clock: Arc<dyn Clock>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      clock,
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>, StoreError> {
    self
      .entries
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("Lock poisoned: {}", e)))
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let now = self.clock.now();
    let mut entries = self.lock()?;

    match entries.get(key) {
      Some(entry) if entry.is_expired(now) => {
        entries.remove(key);
        Ok(None)
      }
      Some(entry) => Ok(Some(entry.clone())),
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
    let entry = CacheEntry::new(key, value, self.clock.now(), ttl);
    self.lock()?.insert(key.to_string(), entry);
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn flush_all(&self, _confirm: FlushConfirmation) -> Result<(), StoreError> {
    self.lock()?.clear();
    Ok(())
  }

  fn ping(&self) -> Result<(), StoreError> {
    self.lock().map(|_| ())
  }

  fn len(&self) -> Result<usize, StoreError> {
    let now = self.clock.now();
    Ok(self.lock()?.values().filter(|e| !e.is_expired(now)).count())
  }

  fn purge_expired(&self) -> Result<usize, StoreError> {
    let now = self.clock.now();
    let mut entries = self.lock()?;
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired(now));
    Ok(before - entries.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;

  fn store() -> (MemoryStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    (MemoryStore::with_clock(clock.clone()), clock)
  }

  #[test]
  fn test_get_returns_value_before_ttl() {
    let (store, clock) = store();
    store.set("paris", b"{\"t\":12}", Duration::from_secs(300)).unwrap();

    clock.advance(TimeDelta::seconds(299));
    let entry = store.get("paris").unwrap().unwrap();
    assert_eq!(entry.value, b"{\"t\":12}");
    assert_eq!(
      entry.expires_at - entry.created_at,
      TimeDelta::seconds(300)
    );
  }

  #[test]
  fn test_get_is_absent_at_ttl() {
    let (store, clock) = store();
    store.set("paris", b"1", Duration::from_secs(300)).unwrap();

    clock.advance(TimeDelta::seconds(300));
    assert!(store.get("paris").unwrap().is_none());
  }

  #[test]
  fn test_set_overwrites_and_resets_expiry() {
    let (store, clock) = store();
    store.set("k", b"old", Duration::from_secs(10)).unwrap();
    clock.advance(TimeDelta::seconds(8));
    store.set("k", b"new", Duration::from_secs(10)).unwrap();
    clock.advance(TimeDelta::seconds(8));

    assert_eq!(store.get("k").unwrap().unwrap().value, b"new");
  }

  #[test]
  fn test_delete_missing_key_is_noop() {
    let (store, _) = store();
    store.delete("nothing").unwrap();
    store.set("k", b"v", Duration::from_secs(10)).unwrap();
    store.delete("k").unwrap();
    assert!(store.get("k").unwrap().is_none());
  }

  #[test]
  fn test_flush_all_empties_store() {
    let (store, _) = store();
    for key in ["a", "b", "c"] {
      store.set(key, b"v", Duration::from_secs(60)).unwrap();
    }
    assert_eq!(store.len().unwrap(), 3);

    store.flush_all(FlushConfirmation::destroy_every_entry()).unwrap();

    assert_eq!(store.len().unwrap(), 0);
    assert!(store.get("a").unwrap().is_none());
  }

  #[test]
  fn test_purge_reclaims_only_expired() {
    let (store, clock) = store();
    store.set("short", b"v", Duration::from_secs(5)).unwrap();
    store.set("long", b"v", Duration::from_secs(500)).unwrap();
    clock.advance(TimeDelta::seconds(10));

    assert_eq!(store.purge_expired().unwrap(), 1);
    assert!(store.get("long").unwrap().is_some());
  }

  #[test]
  fn test_noop_store_always_misses() {
    let store = NoopStore;
    store.set("k", b"v", Duration::from_secs(60)).unwrap();
    assert!(store.get("k").unwrap().is_none());
    assert!(store.ping().is_ok());
  }

  #[test]
  fn test_huge_ttl_saturates() {
    let now = Utc::now();
    assert_eq!(expiry(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
  }
}
