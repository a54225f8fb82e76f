//! Upstream providers and the retry wrapper around them.

mod http;
mod retry;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::UpstreamError;

pub use http::HttpUpstream;
pub use retry::{RetryPolicy, RetryingClient};

/// One logical GET against the configured provider.
///
/// `segments` are appended to the base URL path and escaped individually.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpstreamRequest {
  pub segments: Vec<String>,
  pub query: Vec<(String, String)>,
}

impl UpstreamRequest {
  pub fn get<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      segments: segments.into_iter().map(Into::into).collect(),
      query: Vec::new(),
    }
  }

  pub fn with_query(mut self, name: &str, value: &str) -> Self {
    self.query.push((name.to_string(), value.to_string()));
    self
  }
}

/// Something that can answer an [`UpstreamRequest`] with a JSON document.
#[async_trait]
pub trait Upstream: Send + Sync {
  async fn call(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError>;
}

#[async_trait]
impl<T: Upstream + ?Sized> Upstream for Arc<T> {
  async fn call(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
    (**self).call(request).await
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted upstream for exercising callers without a network.

  use super::*;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  /// Replays queued results in order; once the script runs out it keeps
  /// returning `fallback`. Optionally sleeps before answering.
  pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Result<Value, UpstreamError>>>,
    fallback: Result<Value, UpstreamError>,
    delay: Duration,
    calls: AtomicUsize,
    call_times: Mutex<Vec<tokio::time::Instant>>,
    requests: Mutex<Vec<UpstreamRequest>>,
  }

  impl ScriptedUpstream {
    pub fn always(result: Result<Value, UpstreamError>) -> Self {
      Self {
        script: Mutex::new(VecDeque::new()),
        fallback: result,
        delay: Duration::ZERO,
        calls: AtomicUsize::new(0),
        call_times: Mutex::new(Vec::new()),
        requests: Mutex::new(Vec::new()),
      }
    }

    pub fn then(self, result: Result<Value, UpstreamError>) -> Self {
      self.script.lock().unwrap().push_back(result);
      self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
      self.call_times.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
      self.requests.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Upstream for ScriptedUpstream {
    async fn call(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.call_times.lock().unwrap().push(tokio::time::Instant::now());
      self.requests.lock().unwrap().push(request.clone());

      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }

      let next = self.script.lock().unwrap().pop_front();
      next.unwrap_or_else(|| self.fallback.clone())
    }
  }
}
