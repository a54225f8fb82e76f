mod cache;
mod config;
mod error;
mod gateway;
mod health;
mod logging;
mod upstream;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use cache::{CacheStore, FlushConfirmation, MemoryStore, NoopStore, SqliteStore};
use config::{CacheBackend, CacheConfig, Config};
use error::{FetchError, StoreError};
use gateway::{CachePolicy, FetchCoordinator, FetchResult, Gateway};
use health::{HealthReporter, ProcSampler, WebhookSink};
use upstream::{HttpUpstream, RetryPolicy, RetryingClient};

#[derive(Parser, Debug)]
#[command(name = "cachegate")]
#[command(about = "Cache-aside gateway for slow or flaky HTTP upstreams")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./cachegate.yaml or $XDG_CONFIG_HOME/cachegate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Stop waiting for a lookup after this many seconds
  #[arg(long)]
  timeout: Option<u64>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Current weather for a city
  Weather { city: String },
  /// Whether the vendor has a SKU in stock
  Availability { sku: String },
  /// Exchange rate between two currencies
  Rate { from: String, to: String },
  /// Convert an amount between currencies
  Convert { amount: f64, from: String, to: String },
  /// Check that the cache backend is reachable
  Check,
  /// Drop expired entries from the cache backend
  Purge,
  /// DANGER: delete every cache entry
  Flush {
    /// Required: confirms the flush is intended
    #[arg(long)]
    yes: bool,
  },
  /// Watch CPU and memory, alerting on threshold breaches
  Monitor {
    /// Run a single check and exit
    #[arg(long)]
    once: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  match args.command {
    Command::Weather { city } => {
      let gateway = build_gateway(&config, args.timeout)?;
      print_result(&gateway.weather(&city).await?)
    }
    Command::Availability { sku } => {
      let gateway = build_gateway(&config, args.timeout)?;
      print_result(&gateway.availability(&sku).await?)
    }
    Command::Rate { from, to } => {
      let gateway = build_gateway(&config, args.timeout)?;
      print_result(&gateway.exchange_rate(&from, &to).await?)
    }
    Command::Convert { amount, from, to } => {
      let gateway = build_gateway(&config, args.timeout)?;
      print_result(&gateway.convert(amount, &from, &to).await?)
    }
    Command::Check => {
      let store = open_backend(&config.cache)?;
      println!("cache backend reachable ({} live entries)", store.len()?);
      Ok(())
    }
    Command::Purge => {
      let purged = open_backend(&config.cache)?.purge_expired()?;
      println!("purged {} expired entries", purged);
      Ok(())
    }
    Command::Flush { yes } => {
      if !yes {
        return Err(eyre!("Refusing to flush the whole cache without --yes"));
      }
      warn!("flushing every cache entry");
      open_backend(&config.cache)?.flush_all(FlushConfirmation::destroy_every_entry())?;
      println!("cache flushed");
      Ok(())
    }
    Command::Monitor { once } => run_monitor(&config, once).await,
  }
}

/// Open the configured backend and check it answers. Admin commands use this
/// directly so an unreachable backend is reported, not papered over.
fn open_backend(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, StoreError> {
  let store: Arc<dyn CacheStore> = match config.backend {
    CacheBackend::None => Arc::new(NoopStore),
    CacheBackend::Memory => Arc::new(MemoryStore::new()),
    CacheBackend::Sqlite => {
      let path = config
        .path
        .clone()
        .or_else(SqliteStore::default_path)
        .ok_or_else(|| StoreError::Unavailable("could not determine cache location".to_string()))?;
      let store = SqliteStore::open(&path)?;
      info!(path = %path.display(), "opened cache database");
      Arc::new(store)
    }
  };

  store.ping()?;
  Ok(store)
}

/// Backend for the request path. Anything that fails here degrades to no
/// caching rather than stopping the gateway.
fn open_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
  match open_backend(config) {
    Ok(store) => store,
    Err(e) => {
      warn!(error = %e, "cache backend unreachable, serving live");
      Arc::new(NoopStore)
    }
  }
}

fn build_gateway(
  config: &Config,
  timeout: Option<u64>,
) -> Result<Gateway<Arc<dyn CacheStore>, RetryingClient<HttpUpstream>>, FetchError> {
  let http = HttpUpstream::new(&config.upstream)?;
  let upstream = RetryingClient::new(http, RetryPolicy::from(&config.retry));
  let coordinator = FetchCoordinator::new(
    open_store(&config.cache),
    upstream,
    CachePolicy::from(&config.cache),
  );

  Ok(Gateway::new(coordinator).with_timeout(timeout.map(Duration::from_secs)))
}

fn print_result<T: Serialize>(result: &FetchResult<T>) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(result)?);
  Ok(())
}

async fn run_monitor(config: &Config, once: bool) -> Result<()> {
  let sink = WebhookSink::new(config.health.webhook_url.clone())?;
  let reporter = HealthReporter::new(ProcSampler::new(), sink, &config.health);

  if once {
    reporter.tick().await;
    return Ok(());
  }

  reporter
    .run(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
      }
    })
    .await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Lookup;
  use crate::upstream::testing::ScriptedUpstream;
  use serde_json::json;

  /// A directory where the database file should be: SQLite cannot open it.
  fn unreachable_sqlite(dir: &tempfile::TempDir) -> CacheConfig {
    CacheConfig {
      backend: CacheBackend::Sqlite,
      path: Some(dir.path().to_path_buf()),
      ..CacheConfig::default()
    }
  }

  #[test]
  fn test_admin_path_reports_unreachable_backend() {
    let dir = tempfile::tempdir().unwrap();
    let err = open_backend(&unreachable_sqlite(&dir)).err().unwrap();
    assert!(matches!(err, StoreError::Unavailable(_)));
  }

  #[test]
  fn test_admin_path_opens_working_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
      backend: CacheBackend::Sqlite,
      path: Some(dir.path().join("cache.db")),
      ..CacheConfig::default()
    };

    let store = open_backend(&config).unwrap();
    store.set("k", b"1", Duration::from_secs(60)).unwrap();
    store
      .flush_all(FlushConfirmation::destroy_every_entry())
      .unwrap();
    assert_eq!(store.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_unreachable_backend_still_serves_live() {
    let dir = tempfile::tempdir().unwrap();
    let config = unreachable_sqlite(&dir);
    let upstream = Arc::new(ScriptedUpstream::always(Ok(json!({"temp": 12}))));
    let coordinator = FetchCoordinator::new(
      open_store(&config),
      upstream.clone(),
      CachePolicy::from(&config),
    );

    for _ in 0..2 {
      let result = coordinator.fetch(&Lookup::weather("Paris")).await.unwrap();
      assert_eq!(serde_json::to_value(&result).unwrap()["source"], "live");
    }
    assert_eq!(upstream.calls(), 2);
  }

  #[test]
  fn test_missing_required_credential_is_configuration_error() {
    let mut config = Config::default();
    config.cache.backend = CacheBackend::None;
    config.upstream.credential_required = true;
    config.upstream.credential = None;

    assert!(matches!(
      build_gateway(&config, None),
      Err(FetchError::Configuration(_))
    ));
  }
}
