//! Outbound alert delivery.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Delivery deadline for one alert.
pub const ALERT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget destination for alert text.
#[async_trait]
pub trait AlertSink: Send + Sync {
  async fn send(&self, message: &str) -> Result<()>;
}

/// Posts `{"text": ...}` to a Slack/Teams style webhook.
pub struct WebhookSink {
  client: Client,
  url: Option<String>,
}

impl WebhookSink {
  /// A sink without a URL logs and drops every alert.
  pub fn new(url: Option<String>) -> Result<Self> {
    let client = Client::builder()
      .timeout(ALERT_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create webhook client: {}", e))?;
    Ok(Self { client, url })
  }
}

/// Body sent to the webhook.
pub fn alert_payload(message: &str) -> serde_json::Value {
  json!({ "text": format!("🚨 System Alert: {}", message) })
}

#[async_trait]
impl AlertSink for WebhookSink {
  async fn send(&self, message: &str) -> Result<()> {
    let Some(url) = &self.url else {
      warn!("ALERT_WEBHOOK_URL not set, skipping alert");
      return Ok(());
    };

    let response = self
      .client
      .post(url)
      .json(&alert_payload(message))
      .send()
      .await
      .map_err(|e| eyre!("Failed to deliver alert: {}", e))?;

    if !response.status().is_success() {
      return Err(eyre!("Webhook rejected alert: {}", response.status()));
    }

    info!("alert sent");
    Ok(())
  }
}
