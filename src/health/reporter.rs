//! Periodic sample -> evaluate -> alert loop.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::alert::{AlertSink, ALERT_TIMEOUT};
use super::sampler::{Metric, MetricSource};
use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
  Ok,
  Critical,
}

/// One metric reading from one tick. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
  pub metric: Metric,
  pub value: f64,
  pub status: Status,
}

impl HealthSample {
  /// CRITICAL only when strictly above the threshold.
  pub fn evaluate(metric: Metric, value: f64, threshold: f64) -> Self {
    let status = if value > threshold {
      Status::Critical
    } else {
      Status::Ok
    };
    Self {
      metric,
      value,
      status,
    }
  }
}

pub struct HealthReporter<M, A> {
  source: M,
  sink: A,
  thresholds: Vec<(Metric, f64)>,
  interval: Duration,
}

impl<M: MetricSource, A: AlertSink> HealthReporter<M, A> {
  pub fn new(source: M, sink: A, config: &HealthConfig) -> Self {
    Self {
      source,
      sink,
      thresholds: vec![
        (Metric::Cpu, config.cpu_threshold),
        (Metric::Memory, config.memory_threshold),
      ],
      interval: config.interval(),
    }
  }

  /// One monitoring pass. At most one alert goes out, covering every metric.
  pub async fn tick(&self) -> Vec<HealthSample> {
    let mut samples = Vec::with_capacity(self.thresholds.len());
    for &(metric, threshold) in &self.thresholds {
      match self.source.sample(metric).await {
        Ok(value) => samples.push(HealthSample::evaluate(metric, value, threshold)),
        Err(e) => warn!(%metric, error = %e, "failed to sample metric"),
      }
    }

    info!(report = %report(&samples), "health check");

    if samples.iter().any(|s| s.status == Status::Critical) {
      self.alert(&alert_message(&samples)).await;
    }

    samples
  }

  /// Best effort: failures and slow webhooks are logged, never propagated.
  async fn alert(&self, message: &str) {
    match tokio::time::timeout(ALERT_TIMEOUT, self.sink.send(message)).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => error!(error = %e, "alert delivery failed"),
      Err(_) => error!(timeout = ?ALERT_TIMEOUT, "alert delivery timed out"),
    }
  }

  /// Tick every interval until `shutdown` resolves.
  pub async fn run(&self, shutdown: impl Future<Output = ()>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(interval = ?self.interval, "health reporter started");
    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        _ = ticker.tick() => {
          self.tick().await;
        }
      }
    }
    info!("health reporter stopped");
  }
}

/// JSON document logged on every tick.
fn report(samples: &[HealthSample]) -> Value {
  let mut doc = Map::new();
  doc.insert("timestamp".into(), json!(Utc::now().timestamp_millis() as f64 / 1000.0));
  for sample in samples {
    doc.insert(
      sample.metric.to_string(),
      json!({ "usage": sample.value, "status": sample.status }),
    );
  }
  Value::Object(doc)
}

fn alert_message(samples: &[HealthSample]) -> String {
  let usage: Vec<String> = samples
    .iter()
    .map(|s| format!("{}: {:.1}%", s.metric.label(), s.value))
    .collect();
  format!("High resource usage! {}", usage.join(", "))
}
