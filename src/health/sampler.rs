//! Resource metrics and the Linux `/proc` sampler.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// A resource the reporter knows how to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
  Cpu,
  Memory,
}

impl Metric {
  /// Label used in alert text
  pub fn label(self) -> &'static str {
    match self {
      Self::Cpu => "CPU",
      Self::Memory => "MEM",
    }
  }
}

impl fmt::Display for Metric {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Cpu => write!(f, "cpu"),
      Self::Memory => write!(f, "memory"),
    }
  }
}

/// Produces the current usage percentage for a metric.
#[async_trait]
pub trait MetricSource: Send + Sync {
  async fn sample(&self, metric: Metric) -> Result<f64>;
}

/// Reads `/proc/stat` and `/proc/meminfo`.
pub struct ProcSampler {
  /// CPU usage is averaged over this window
  cpu_window: Duration,
}

impl ProcSampler {
  pub fn new() -> Self {
    Self {
      cpu_window: Duration::from_secs(1),
    }
  }

  async fn cpu_percent(&self) -> Result<f64> {
    let before = parse_cpu_times(&read_proc("/proc/stat").await?)?;
    tokio::time::sleep(self.cpu_window).await;
    let after = parse_cpu_times(&read_proc("/proc/stat").await?)?;
    Ok(before.busy_percent_until(&after))
  }

  async fn memory_percent(&self) -> Result<f64> {
    parse_memory_percent(&read_proc("/proc/meminfo").await?)
  }
}

impl Default for ProcSampler {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl MetricSource for ProcSampler {
  async fn sample(&self, metric: Metric) -> Result<f64> {
    match metric {
      Metric::Cpu => self.cpu_percent().await,
      Metric::Memory => self.memory_percent().await,
    }
  }
}

async fn read_proc(path: &str) -> Result<String> {
  tokio::fs::read_to_string(path)
    .await
    .map_err(|e| eyre!("Failed to read {}: {}", path, e))
}

/// Aggregate jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
  idle: u64,
  total: u64,
}

impl CpuTimes {
  fn busy_percent_until(&self, later: &CpuTimes) -> f64 {
    let total = later.total.saturating_sub(self.total);
    if total == 0 {
      return 0.0;
    }
    let idle = later.idle.saturating_sub(self.idle);
    (total.saturating_sub(idle)) as f64 / total as f64 * 100.0
  }
}

fn parse_cpu_times(stat: &str) -> Result<CpuTimes> {
  let line = stat
    .lines()
    .find(|l| l.starts_with("cpu "))
    .ok_or_else(|| eyre!("No aggregate cpu line in /proc/stat"))?;

  let fields: Vec<u64> = line
    .split_whitespace()
    .skip(1)
    .take(8) // guest time is already folded into user
    .map(|f| f.parse::<u64>())
    .collect::<std::result::Result<_, _>>()
    .map_err(|e| eyre!("Malformed cpu line {:?}: {}", line, e))?;

  if fields.len() < 4 {
    return Err(eyre!("Too few fields in cpu line {:?}", line));
  }

  // idle + iowait
  let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
  Ok(CpuTimes {
    idle,
    total: fields.iter().sum(),
  })
}

fn parse_memory_percent(meminfo: &str) -> Result<f64> {
  let field = |name: &str| -> Option<u64> {
    meminfo
      .lines()
      .find(|l| l.starts_with(name))
      .and_then(|l| l.split_whitespace().nth(1))
      .and_then(|v| v.parse().ok())
  };

  let total = field("MemTotal:").ok_or_else(|| eyre!("MemTotal missing from /proc/meminfo"))?;
  let available =
    field("MemAvailable:").ok_or_else(|| eyre!("MemAvailable missing from /proc/meminfo"))?;

  if total == 0 {
    return Err(eyre!("MemTotal is zero"));
  }
  Ok(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}
