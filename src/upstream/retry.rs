//! Fixed-wait retry wrapper for any [`Upstream`].

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::{Upstream, UpstreamRequest};
use crate::config::RetryConfig;
use crate::error::UpstreamError;

/// Bounded attempts with a constant pause between them. No exponential growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first one
  pub attempts: u32,
  /// Pause between consecutive attempts
  pub wait: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 3,
      wait: Duration::from_secs(2),
    }
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      attempts: config.attempts.max(1),
      wait: Duration::from_secs(config.wait_secs),
    }
  }
}

/// Retries transient failures of the wrapped upstream; everything else is
/// returned on the spot. Holds no state between calls.
pub struct RetryingClient<U> {
  inner: U,
  policy: RetryPolicy,
}

impl<U: Upstream> RetryingClient<U> {
  pub fn new(inner: U, policy: RetryPolicy) -> Self {
    Self { inner, policy }
  }
}

#[async_trait]
impl<U: Upstream> Upstream for RetryingClient<U> {
  async fn call(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
    let attempts = self.policy.attempts.max(1);
    let mut attempt = 1;

    loop {
      match self.inner.call(request).await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_transient() && attempt < attempts => {
          warn!(attempt, attempts, error = %err, "upstream call failed, retrying");
          tokio::time::sleep(self.policy.wait).await;
          attempt += 1;
        }
        Err(err) => {
          if err.is_transient() {
            warn!(attempts, error = %err, "upstream retries exhausted");
          }
          return Err(err);
        }
      }
    }
  }
}
