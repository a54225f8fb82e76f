//! Cache-aside orchestration with per-key in-flight de-duplication.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Lookup, Namespace};
use crate::config::CacheConfig;
use crate::error::{FetchError, UpstreamError};
use crate::upstream::Upstream;

/// Where a served payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  /// Served from the cache store without touching the upstream
  Cache,
  /// Fetched from the upstream for this request (or one it joined)
  Live,
}

/// Successful outcome of a fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult<T = Value> {
  pub source: Source,
  pub payload: T,
  /// When the served value was written to the cache
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> FetchResult<T> {
  pub fn live(payload: T) -> Self {
    Self {
      source: Source::Live,
      payload,
      cached_at: None,
    }
  }

  pub fn cached(payload: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      source: Source::Cache,
      payload,
      cached_at: Some(cached_at),
    }
  }

  /// Convert the payload, keeping the source tag.
  pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<FetchResult<U>, E> {
    Ok(FetchResult {
      source: self.source,
      payload: f(self.payload)?,
      cached_at: self.cached_at,
    })
  }
}

/// What a remembered "not found" looks like in the negative namespace.
#[derive(Debug, Serialize, Deserialize)]
struct NegativeEntry {
  detail: String,
}

/// TTLs applied when populating the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
  pub ttl: Duration,
  /// Negative caching is off when this is `None`
  pub negative_ttl: Option<Duration>,
}

impl From<&CacheConfig> for CachePolicy {
  fn from(config: &CacheConfig) -> Self {
    Self {
      ttl: config.ttl(),
      negative_ttl: config.negative_ttl(),
    }
  }
}

type Outcome = Result<FetchResult, FetchError>;
type Flight = Shared<BoxFuture<'static, Outcome>>;

/// Checks the cache, falls back to the upstream on a miss, and populates the
/// cache with what came back.
///
/// Concurrent misses on one key share a single upstream call. The call runs
/// on its own task, so callers that stop waiting do not cancel it.
pub struct FetchCoordinator<S, U> {
  inner: Arc<Inner<S, U>>,
}

struct Inner<S, U> {
  store: S,
  upstream: U,
  policy: CachePolicy,
  in_flight: Mutex<HashMap<String, Flight>>,
}

impl<S, U> FetchCoordinator<S, U>
where
  S: CacheStore + 'static,
  U: Upstream + 'static,
{
  pub fn new(store: S, upstream: U, policy: CachePolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        upstream,
        policy,
        in_flight: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Resolve `lookup` from the cache or, on a miss, from the upstream.
  pub async fn fetch(&self, lookup: &Lookup) -> Outcome {
    if let Some(outcome) = self.inner.check_cache(lookup).await {
      return outcome;
    }

    self.join_or_start(lookup).await
  }

  /// Like [`fetch`](Self::fetch) but gives up waiting after `timeout`.
  ///
  /// Giving up only affects this caller: the upstream call keeps going and
  /// other waiters still get its result.
  pub async fn fetch_with_timeout(&self, lookup: &Lookup, timeout: Duration) -> Outcome {
    match tokio::time::timeout(timeout, self.fetch(lookup)).await {
      Ok(outcome) => outcome,
      Err(_) => {
        warn!(lookup = %lookup.description(), ?timeout, "gave up waiting for fetch");
        Err(FetchError::Timeout(timeout))
      }
    }
  }

  #[cfg(test)]
  pub fn store(&self) -> &S {
    &self.inner.store
  }

  /// Attach to the in-flight call for this key, or become its leader.
  ///
  /// Lookup and insertion happen under one lock, so two callers can never
  /// both see "nothing in flight" for the same key.
  fn join_or_start(&self, lookup: &Lookup) -> Flight {
    let key = lookup.cache_key(Namespace::Positive);
    let mut in_flight = self.inner.lock_in_flight();

    if let Some(flight) = in_flight.get(&key) {
      debug!(key = %key, "joining in-flight fetch");
      return flight.clone();
    }

    let inner = Arc::clone(&self.inner);
    let task_lookup = lookup.clone();
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      // Clears the entry even if the flight panics, so the key is not stuck
      let _landing = Landing {
        inner: Arc::clone(&inner),
        key: task_key.clone(),
      };
      inner.fetch_live(&task_lookup).await
    });

    let flight = async move {
      handle
        .await
        .unwrap_or_else(|e| Err(FetchError::Internal(format!("fetch task failed: {}", e))))
    }
    .boxed()
    .shared();

    in_flight.insert(key, flight.clone());
    flight
  }

  #[cfg(test)]
  fn in_flight_len(&self) -> usize {
    self.inner.lock_in_flight().len()
  }
}

impl<S, U> Clone for FetchCoordinator<S, U> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Removes a flight from the in-flight map when its task ends, however it ends.
struct Landing<S, U> {
  inner: Arc<Inner<S, U>>,
  key: String,
}

impl<S, U> Drop for Landing<S, U> {
  fn drop(&mut self) {
    self.inner.lock_in_flight().remove(&self.key);
  }
}

impl<S, U> Inner<S, U> {
  fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Flight>> {
    // The map is always left consistent, so a poisoned lock is still usable
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<S, U> Inner<S, U>
where
  S: CacheStore + 'static,
  U: Upstream + 'static,
{
  /// Run a store operation on the blocking pool. The SQLite backend can wait
  /// up to its busy timeout on another process's lock.
  async fn with_store<T, F>(self: &Arc<Self>, op: F) -> Option<T>
  where
    F: FnOnce(&Self) -> T + Send + 'static,
    T: Send + 'static,
  {
    let inner = Arc::clone(self);
    match tokio::task::spawn_blocking(move || op(&inner)).await {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(error = %e, "cache operation failed");
        None
      }
    }
  }

  async fn check_cache(self: &Arc<Self>, lookup: &Lookup) -> Option<Outcome> {
    let lookup = lookup.clone();
    self
      .with_store(move |inner| inner.read_cache(&lookup))
      .await
      .flatten()
  }

  /// Cache lookup. `None` means "go to the upstream"; store failures land
  /// there too.
  fn read_cache(&self, lookup: &Lookup) -> Option<Outcome> {
    let key = lookup.cache_key(Namespace::Positive);

    match self.store.get(&key) {
      Ok(Some(entry)) => match serde_json::from_slice::<Value>(&entry.value) {
        Ok(payload) => {
          debug!(key = %entry.key, "cache hit");
          return Some(Ok(FetchResult::cached(payload, entry.created_at)));
        }
        Err(e) => {
          warn!(key = %key, error = %e, "dropping undecodable cache entry");
          if let Err(e) = self.store.delete(&key) {
            warn!(key = %key, error = %e, "failed to delete cache entry");
          }
        }
      },
      Ok(None) => {}
      Err(e) => {
        warn!(key = %key, error = %e, "cache unavailable, fetching live");
        return None;
      }
    }

    if self.policy.negative_ttl.is_some() {
      let neg_key = lookup.cache_key(Namespace::Negative);
      match self.store.get(&neg_key) {
        Ok(Some(entry)) => {
          let detail = serde_json::from_slice::<NegativeEntry>(&entry.value)
            .map(|n| n.detail)
            .unwrap_or_else(|_| lookup.description());
          debug!(key = %neg_key, "negative cache hit");
          return Some(Err(FetchError::NotFound(detail)));
        }
        Ok(None) => {}
        Err(e) => warn!(key = %neg_key, error = %e, "negative cache unavailable"),
      }
    }

    None
  }

  /// Leader side of a miss. Runs on its own task.
  async fn fetch_live(self: &Arc<Self>, lookup: &Lookup) -> Outcome {
    // A flight that finished between our miss and taking the lock has
    // already populated the cache
    match self.check_cache(lookup).await {
      Some(outcome) => outcome,
      None => self.call_and_populate(lookup).await,
    }
  }

  async fn call_and_populate(self: &Arc<Self>, lookup: &Lookup) -> Outcome {
    info!(lookup = %lookup.description(), "fetching live");

    let result = self
      .upstream
      .call(&lookup.request())
      .await
      .and_then(|body| lookup.extract(body));

    match result {
      Ok(payload) => {
        let key = lookup.cache_key(Namespace::Positive);
        let cached = payload.clone();
        self
          .with_store(move |inner| inner.populate(&key, &cached))
          .await;
        Ok(FetchResult::live(payload))
      }
      Err(UpstreamError::NotFound(detail)) => {
        if let Some(ttl) = self.policy.negative_ttl {
          let lookup = lookup.clone();
          let remembered = detail.clone();
          self
            .with_store(move |inner| inner.remember_not_found(&lookup, &remembered, ttl))
            .await;
        }
        Err(FetchError::NotFound(detail))
      }
      Err(err) => {
        warn!(lookup = %lookup.description(), error = %err, "live fetch failed");
        Err(err.into())
      }
    }
  }

  fn populate(&self, key: &str, payload: &Value) {
    let bytes = match serde_json::to_vec(payload) {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(key = %key, error = %e, "payload not serializable, not caching");
        return;
      }
    };

    if let Err(e) = self.store.set(key, &bytes, self.policy.ttl) {
      warn!(key = %key, error = %e, "failed to populate cache");
    }
  }

  fn remember_not_found(&self, lookup: &Lookup, detail: &str, ttl: Duration) {
    let key = lookup.cache_key(Namespace::Negative);
    let entry = NegativeEntry {
      detail: detail.to_string(),
    };

    let stored = serde_json::to_vec(&entry)
      .map_err(|e| e.to_string())
      .and_then(|bytes| self.store.set(&key, &bytes, ttl).map_err(|e| e.to_string()));
    if let Err(e) = stored {
      warn!(key = %key, error = %e, "failed to remember not-found");
    }
  }
}
