use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub upstream: UpstreamConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub health: HealthConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
  /// `Authorization: Bearer <credential>` header
  #[default]
  Bearer,
  /// Credential sent as a query parameter (see `credential_param`)
  Query,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  pub url: String,
  pub auth_type: AuthType,
  /// Query parameter name when `auth_type` is `query` (e.g. "appid")
  pub credential_param: String,
  /// Refuse to build the client without a credential
  pub credential_required: bool,
  pub timeout_secs: u64,
  /// Only ever taken from the environment
  #[serde(skip)]
  pub credential: Option<String>,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      url: "https://api.supplier.com/v1".to_string(),
      auth_type: AuthType::Bearer,
      credential_param: "appid".to_string(),
      credential_required: false,
      timeout_secs: 30,
      credential: None,
    }
  }
}

impl UpstreamConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl fmt::Debug for UpstreamConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UpstreamConfig")
      .field("url", &self.url)
      .field("auth_type", &self.auth_type)
      .field("credential_param", &self.credential_param)
      .field("credential_required", &self.credential_required)
      .field("timeout_secs", &self.timeout_secs)
      .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
      .finish()
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
  /// SQLite file, shareable between processes
  #[default]
  Sqlite,
  /// Process-local map
  Memory,
  /// Caching disabled
  None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub backend: CacheBackend,
  /// Database file for the sqlite backend (default: $XDG_DATA_HOME/cachegate/cache.db)
  pub path: Option<PathBuf>,
  pub ttl_secs: u64,
  /// Remember "not found" answers for this long. Disabled when unset.
  pub negative_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: CacheBackend::Sqlite,
      path: None,
      ttl_secs: 300,
      negative_ttl_secs: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }

  pub fn negative_ttl(&self) -> Option<Duration> {
    self.negative_ttl_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub attempts: u32,
  pub wait_secs: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      attempts: 3,
      wait_secs: 2,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
  pub interval_secs: u64,
  /// Slack/Teams style webhook. Alerts are skipped when unset.
  pub webhook_url: Option<String>,
  pub cpu_threshold: f64,
  pub memory_threshold: f64,
}

impl Default for HealthConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60,
      webhook_url: None,
      cpu_threshold: 85.0,
      memory_threshold: 90.0,
    }
  }
}

impl HealthConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive when RUST_LOG is not set
  pub level: String,
  /// Also write logs to a daily-rolled file in this directory
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration, then apply environment overrides and validate.
  ///
  /// File search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./cachegate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cachegate/config.yaml
  ///
  /// No file at all means built-in defaults.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    let config = config.apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("cachegate.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cachegate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Overlay environment variables on top of the file values.
  ///
  /// `lookup` is `std::env::var` in production; tests pass a map.
  pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(url) = lookup("UPSTREAM_URL") {
      self.upstream.url = url;
    }
    if let Some(token) = lookup("UPSTREAM_TOKEN").filter(|t| !t.is_empty()) {
      self.upstream.credential = Some(token);
    }
    if let Some(v) = parse_var(&lookup, "API_TIMEOUT")? {
      self.upstream.timeout_secs = v;
    }

    if let Some(path) = lookup("CACHE_PATH") {
      self.cache.path = Some(PathBuf::from(path));
    }
    if let Some(v) = parse_var(&lookup, "CACHE_TTL")? {
      self.cache.ttl_secs = v;
    }
    if let Some(v) = parse_var(&lookup, "NEGATIVE_CACHE_TTL")? {
      self.cache.negative_ttl_secs = Some(v);
    }

    if let Some(v) = parse_var(&lookup, "RETRY_ATTEMPTS")? {
      self.retry.attempts = v;
    }
    if let Some(v) = parse_var(&lookup, "RETRY_WAIT")? {
      self.retry.wait_secs = v;
    }

    if let Some(url) = lookup("ALERT_WEBHOOK_URL").filter(|u| !u.is_empty()) {
      self.health.webhook_url = Some(url);
    }
    if let Some(v) = parse_var(&lookup, "MONITOR_INTERVAL")? {
      self.health.interval_secs = v;
    }
    if let Some(v) = parse_var(&lookup, "CPU_THRESHOLD")? {
      self.health.cpu_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "MEMORY_THRESHOLD")? {
      self.health.memory_threshold = v;
    }

    if let Some(level) = lookup("LOG_LEVEL") {
      self.log.level = level;
    }

    Ok(self)
  }

  pub fn validate(&self) -> Result<()> {
    check_http_url("upstream.url", &self.upstream.url)?;
    if let Some(webhook) = &self.health.webhook_url {
      check_http_url("health.webhook_url", webhook)?;
    }

    if self.upstream.timeout_secs == 0 {
      return Err(eyre!("upstream.timeout_secs must be greater than zero"));
    }
    if self.upstream.auth_type == AuthType::Query && self.upstream.credential_param.is_empty() {
      return Err(eyre!("upstream.credential_param is required for query auth"));
    }
    if self.cache.ttl_secs == 0 {
      return Err(eyre!("cache.ttl_secs must be greater than zero"));
    }
    if self.cache.negative_ttl_secs == Some(0) {
      return Err(eyre!("cache.negative_ttl_secs must be greater than zero when set"));
    }
    if self.retry.attempts == 0 {
      return Err(eyre!("retry.attempts must be at least 1"));
    }
    if self.health.interval_secs == 0 {
      return Err(eyre!("health.interval_secs must be greater than zero"));
    }

    for (name, value) in [
      ("health.cpu_threshold", self.health.cpu_threshold),
      ("health.memory_threshold", self.health.memory_threshold),
    ] {
      if !(value > 0.0 && value <= 100.0) {
        return Err(eyre!("{} must be within (0, 100], got {}", name, value));
      }
    }

    Ok(())
  }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
  T::Err: fmt::Display,
{
  match lookup(name) {
    Some(raw) => raw
      .trim()
      .parse()
      .map(Some)
      .map_err(|e| eyre!("Invalid value for {}: {:?} ({})", name, raw, e)),
    None => Ok(None),
  }
}

fn check_http_url(field: &str, raw: &str) -> Result<()> {
  let url = Url::parse(raw).map_err(|e| eyre!("{} is not a valid URL ({}): {}", field, raw, e))?;
  match url.scheme() {
    "http" | "https" => Ok(()),
    other => Err(eyre!("{} must be http(s), got {}", field, other)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name| map.get(name).cloned()
  }

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.cache.ttl(), Duration::from_secs(300));
    assert_eq!(config.retry.attempts, 3);
    assert_eq!(config.retry.wait_secs, 2);
    assert_eq!(config.upstream.timeout(), Duration::from_secs(30));
    assert!(config.cache.negative_ttl().is_none());
  }

  #[test]
  fn test_yaml_partial_file() {
    let yaml = r#"
upstream:
  url: https://api.openweathermap.org/data/2.5
  auth_type: query
  credential_required: true
cache:
  backend: memory
  ttl_secs: 3600
  negative_ttl_secs: 30
health:
  cpu_threshold: 75
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.upstream.auth_type, AuthType::Query);
    assert_eq!(config.upstream.credential_param, "appid");
    assert!(config.upstream.credential_required);
    assert_eq!(config.cache.backend, CacheBackend::Memory);
    assert_eq!(config.cache.negative_ttl(), Some(Duration::from_secs(30)));
    assert_eq!(config.health.cpu_threshold, 75.0);
    assert_eq!(config.health.memory_threshold, 90.0);
    assert_eq!(config.retry.attempts, 3);
  }

  #[test]
  fn test_env_overrides_file() {
    let config = Config::default()
      .apply_env(env(&[
        ("UPSTREAM_URL", "http://localhost:9000/v4/latest/"),
        ("UPSTREAM_TOKEN", "secret"),
        ("CACHE_TTL", "60"),
        ("NEGATIVE_CACHE_TTL", "5"),
        ("RETRY_ATTEMPTS", "5"),
        ("RETRY_WAIT", "1"),
        ("CPU_THRESHOLD", "50.5"),
        ("ALERT_WEBHOOK_URL", "https://hooks.example.com/T000"),
      ]))
      .unwrap();

    assert_eq!(config.upstream.url, "http://localhost:9000/v4/latest/");
    assert_eq!(config.upstream.credential.as_deref(), Some("secret"));
    assert_eq!(config.cache.ttl_secs, 60);
    assert_eq!(config.cache.negative_ttl_secs, Some(5));
    assert_eq!(config.retry.attempts, 5);
    assert_eq!(config.retry.wait_secs, 1);
    assert_eq!(config.health.cpu_threshold, 50.5);
    assert!(config.health.webhook_url.is_some());
    config.validate().unwrap();
  }

  #[test]
  fn test_bad_env_number_is_reported() {
    let err = Config::default()
      .apply_env(env(&[("CACHE_TTL", "five minutes")]))
      .unwrap_err();
    assert!(err.to_string().contains("CACHE_TTL"));
  }

  #[test]
  fn test_empty_token_is_ignored() {
    let config = Config::default()
      .apply_env(env(&[("UPSTREAM_TOKEN", "")]))
      .unwrap();
    assert!(config.upstream.credential.is_none());
  }

  #[test]
  fn test_validation_rejects_nonsense() {
    let mut config = Config::default();
    config.retry.attempts = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.health.memory_threshold = 120.0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.upstream.url = "ftp://example.com".to_string();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.cache.negative_ttl_secs = Some(0);
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_debug_redacts_credential() {
    let mut config = UpstreamConfig::default();
    config.credential = Some("hunter2".to_string());
    let printed = format!("{:?}", config);
    assert!(!printed.contains("hunter2"));
    assert!(printed.contains("REDACTED"));
  }
}
