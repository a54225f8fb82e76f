//! The request surface: one typed read per logical lookup.

use serde_json::Value;
use std::time::Duration;

use super::coordinator::{FetchCoordinator, FetchResult};
use crate::cache::{CacheStore, Lookup};
use crate::error::{FetchError, UpstreamError};
use crate::upstream::{Upstream, UpstreamRequest};

impl Lookup {
  /// The upstream call that answers this lookup.
  pub fn request(&self) -> UpstreamRequest {
    match self {
      Self::Weather { city } => UpstreamRequest::get(["weather"]).with_query("q", city),
      Self::Availability { sku } => UpstreamRequest::get(["products", sku.as_str(), "availability"]),
      Self::ExchangeRate { from, .. } => UpstreamRequest::get([from.as_str()]),
    }
  }

  /// Reduce the upstream response to the payload worth caching.
  pub fn extract(&self, body: Value) -> Result<Value, UpstreamError> {
    match self {
      Self::Weather { .. } => Ok(body),
      // Vendor omits the flag for discontinued items
      Self::Availability { .. } => Ok(Value::Bool(
        body.get("in_stock").and_then(Value::as_bool).unwrap_or(false),
      )),
      Self::ExchangeRate { from, to } => {
        let rates = body
          .get("rates")
          .and_then(Value::as_object)
          .ok_or_else(|| UpstreamError::Permanent(format!("No rates table for {}", from)))?;

        rates
          .get(to)
          .filter(|rate| rate.is_number())
          .cloned()
          .ok_or_else(|| UpstreamError::NotFound(format!("No rate for {} -> {}", from, to)))
      }
    }
  }
}

/// Typed lookups on top of the fetch coordinator.
pub struct Gateway<S, U> {
  coordinator: FetchCoordinator<S, U>,
  /// Overall per-call wait limit, if any
  timeout: Option<Duration>,
}

impl<S, U> Gateway<S, U>
where
  S: CacheStore + 'static,
  U: Upstream + 'static,
{
  pub fn new(coordinator: FetchCoordinator<S, U>) -> Self {
    Self {
      coordinator,
      timeout: None,
    }
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  async fn fetch(&self, lookup: &Lookup) -> Result<FetchResult, FetchError> {
    match self.timeout {
      Some(timeout) => self.coordinator.fetch_with_timeout(lookup, timeout).await,
      None => self.coordinator.fetch(lookup).await,
    }
  }

  /// Current weather document for a city, as the provider returned it.
  pub async fn weather(&self, city: &str) -> Result<FetchResult, FetchError> {
    self.fetch(&Lookup::weather(city)).await
  }

  /// Whether the vendor has the SKU in stock.
  pub async fn availability(&self, sku: &str) -> Result<FetchResult<bool>, FetchError> {
    self
      .fetch(&Lookup::availability(sku))
      .await?
      .try_map(|payload| {
        payload
          .as_bool()
          .ok_or_else(|| FetchError::Internal(format!("availability payload is not a bool: {}", payload)))
      })
  }

  /// Units of `to` per unit of `from`.
  pub async fn exchange_rate(&self, from: &str, to: &str) -> Result<FetchResult<f64>, FetchError> {
    self
      .fetch(&Lookup::exchange_rate(from, to))
      .await?
      .try_map(|payload| {
        payload
          .as_f64()
          .ok_or_else(|| FetchError::Internal(format!("rate payload is not a number: {}", payload)))
      })
  }

  /// `amount` of `from` expressed in `to`.
  pub async fn convert(&self, amount: f64, from: &str, to: &str) -> Result<FetchResult<f64>, FetchError> {
    self
      .exchange_rate(from, to)
      .await?
      .try_map(|rate| Ok(amount * rate))
  }
}
