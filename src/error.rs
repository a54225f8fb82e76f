//! Error taxonomy shared by the cache store, the upstream client and the gateway.

use std::time::Duration;

/// Failure of the cache backend. Never fatal to a fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
  #[error("cache store unavailable: {0}")]
  Unavailable(String),

  #[error("cache entry could not be decoded: {0}")]
  Corrupt(String),
}

/// Outcome of a single upstream attempt that did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
  /// Network failure, timeout, 5xx or 429. Worth retrying.
  #[error("transient upstream failure: {0}")]
  Transient(String),

  /// Malformed request, 4xx, unusable response body. Never retried.
  #[error("permanent upstream failure: {0}")]
  Permanent(String),

  /// The upstream answered and the thing does not exist.
  #[error("not found upstream: {0}")]
  NotFound(String),
}

impl UpstreamError {
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient(_))
  }
}

/// Construction-time configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Error handed back to gateway callers.
///
/// Cache store failures are absorbed before they get here, so there is no
/// store variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("upstream unavailable: {0}")]
  UpstreamUnavailable(String),

  #[error("upstream rejected the request: {0}")]
  UpstreamRejected(String),

  #[error(transparent)]
  Configuration(#[from] ConfigError),

  #[error("gave up waiting after {0:?}")]
  Timeout(Duration),

  #[error("internal error: {0}")]
  Internal(String),
}

impl From<UpstreamError> for FetchError {
  fn from(err: UpstreamError) -> Self {
    match err {
      UpstreamError::Transient(msg) => Self::UpstreamUnavailable(msg),
      UpstreamError::Permanent(msg) => Self::UpstreamRejected(msg),
      UpstreamError::NotFound(msg) => Self::NotFound(msg),
    }
  }
}
