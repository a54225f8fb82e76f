use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::fmt;
use tracing::debug;
use url::Url;

use super::{Upstream, UpstreamRequest};
use crate::config::{AuthType, UpstreamConfig};
use crate::error::{ConfigError, UpstreamError};

const USER_AGENT: &str = concat!("cachegate/", env!("CARGO_PKG_VERSION"));

/// Plain HTTP provider: one GET per call, no retries, JSON responses.
#[derive(Clone)]
pub struct HttpUpstream {
  client: Client,
  base: Url,
  auth_type: AuthType,
  credential_param: String,
  credential: Option<String>,
}

impl HttpUpstream {
  pub fn new(config: &UpstreamConfig) -> Result<Self, ConfigError> {
    let base = Url::parse(&config.url)
      .map_err(|e| ConfigError(format!("Invalid upstream URL {}: {}", config.url, e)))?;
    if base.cannot_be_a_base() {
      return Err(ConfigError(format!("Upstream URL cannot be a base: {}", config.url)));
    }

    if config.credential_required && config.credential.is_none() {
      return Err(ConfigError(
        "Upstream credential not found. Set the UPSTREAM_TOKEN environment variable.".to_string(),
      ));
    }

    let client = Client::builder()
      .timeout(config.timeout())
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| ConfigError(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      auth_type: config.auth_type,
      credential_param: config.credential_param.clone(),
      credential: config.credential.clone(),
    })
  }

  /// Absolute URL for a request, credential included for query auth.
  fn url_for(&self, request: &UpstreamRequest) -> Result<Url, UpstreamError> {
    let mut url = self.base.clone();
    {
      let mut path = url
        .path_segments_mut()
        .map_err(|_| UpstreamError::Permanent(format!("Cannot extend URL {}", self.base)))?;
      path.pop_if_empty();
      path.extend(&request.segments);
    }

    let credential = match (self.auth_type, &self.credential) {
      (AuthType::Query, Some(token)) => Some((self.credential_param.as_str(), token.as_str())),
      _ => None,
    };

    if !request.query.is_empty() || credential.is_some() {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in &request.query {
        pairs.append_pair(name, value);
      }
      if let Some((name, value)) = credential {
        pairs.append_pair(name, value);
      }
    }

    Ok(url)
  }
}

#[async_trait]
impl Upstream for HttpUpstream {
  async fn call(&self, request: &UpstreamRequest) -> Result<Value, UpstreamError> {
    let url = self.url_for(request)?;
    debug!(path = %url.path(), "upstream GET");

    let mut builder = self.client.get(url);
    if let (AuthType::Bearer, Some(token)) = (self.auth_type, &self.credential) {
      builder = builder.bearer_auth(token);
    }

    let response = builder.send().await.map_err(classify_send_error)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &body));
    }

    response.json::<Value>().await.map_err(|e| {
      if e.is_decode() {
        UpstreamError::Permanent(format!("Upstream returned invalid JSON: {}", e))
      } else {
        UpstreamError::Transient(format!("Failed to read upstream response: {}", e))
      }
    })
  }
}

/// Map a non-success status to the retry taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
  let detail = if body.is_empty() {
    status.to_string()
  } else {
    format!("{}: {}", status, truncate(body, 200))
  };

  match status {
    StatusCode::NOT_FOUND => UpstreamError::NotFound(detail),
    StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => UpstreamError::Transient(detail),
    s if s.is_server_error() => UpstreamError::Transient(detail),
    _ => UpstreamError::Permanent(detail),
  }
}

fn classify_send_error(err: reqwest::Error) -> UpstreamError {
  if err.is_builder() {
    UpstreamError::Permanent(format!("Malformed upstream request: {}", err))
  } else {
    // Connect failures, timeouts, resets
    UpstreamError::Transient(format!("Upstream request failed: {}", err))
  }
}

fn truncate(s: &str, max: usize) -> &str {
  match s.char_indices().nth(max) {
    Some((idx, _)) => &s[..idx],
    None => s,
  }
}

impl fmt::Debug for HttpUpstream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpUpstream")
      .field("base", &self.base.as_str())
      .field("auth_type", &self.auth_type)
      .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
      .finish()
  }
}
