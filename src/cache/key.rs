//! Key codec: maps a logical lookup to the string it is cached under.

use sha2::{Digest, Sha256};

/// Which half of the keyspace an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
  /// Values the upstream actually returned
  Positive,
  /// Remembered "not found" answers
  Negative,
}

impl Namespace {
  fn prefix(self) -> &'static str {
    match self {
      Self::Positive => "pos",
      Self::Negative => "neg",
    }
  }
}

/// One logical read the gateway knows how to serve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
  /// Current weather for a city
  Weather { city: String },
  /// Stock availability for a vendor SKU
  Availability { sku: String },
  /// Exchange rate from one currency into another
  ExchangeRate { from: String, to: String },
}

impl Lookup {
  pub fn weather(city: &str) -> Self {
    Self::Weather {
      city: city.trim().to_lowercase(),
    }
  }

  pub fn availability(sku: &str) -> Self {
    Self::Availability {
      sku: sku.trim().to_string(),
    }
  }

  pub fn exchange_rate(from: &str, to: &str) -> Self {
    Self::ExchangeRate {
      from: normalize_currency(from),
      to: normalize_currency(to),
    }
  }

  /// Short name of the lookup kind, kept readable inside the key.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Weather { .. } => "weather",
      Self::Availability { .. } => "availability",
      Self::ExchangeRate { .. } => "rate",
    }
  }

  /// Cache key for this lookup in the given namespace.
  ///
  /// Fields are hashed with a separator that cannot appear in normalized
  /// input, so `("AB", "C")` and `("A", "BC")` never meet.
  pub fn cache_key(&self, namespace: Namespace) -> String {
    let fields: Vec<&str> = match self {
      Self::Weather { city } => vec![city],
      Self::Availability { sku } => vec![sku],
      Self::ExchangeRate { from, to } => vec![from, to],
    };

    let mut hasher = Sha256::new();
    hasher.update(self.kind().as_bytes());
    for field in fields {
      hasher.update([0x1f]);
      hasher.update(field.as_bytes());
    }

    format!(
      "{}:{}:{}",
      namespace.prefix(),
      self.kind(),
      hex::encode(hasher.finalize())
    )
  }

  pub fn description(&self) -> String {
    match self {
      Self::Weather { city } => format!("weather for {}", city),
      Self::Availability { sku } => format!("availability of {}", sku),
      Self::ExchangeRate { from, to } => format!("rate {} -> {}", from, to),
    }
  }
}

/// Currency codes are case-insensitive, so "usd" and "USD" share an entry.
fn normalize_currency(code: &str) -> String {
  code.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_same_lookup_same_key() {
    let a = Lookup::weather("Paris");
    let b = Lookup::weather("  paris ");
    assert_eq!(
      a.cache_key(Namespace::Positive),
      b.cache_key(Namespace::Positive)
    );
  }

  #[test]
  fn test_currency_pairs_do_not_collide() {
    let usd_eur = Lookup::exchange_rate("USD", "EUR");
    let eur_usd = Lookup::exchange_rate("EUR", "USD");
    let usd_gbp = Lookup::exchange_rate("usd", "gbp");

    let keys = [
      usd_eur.cache_key(Namespace::Positive),
      eur_usd.cache_key(Namespace::Positive),
      usd_gbp.cache_key(Namespace::Positive),
    ];
    assert_ne!(keys[0], keys[1]);
    assert_ne!(keys[0], keys[2]);
    assert_ne!(keys[1], keys[2]);
  }

  #[test]
  fn test_field_boundaries_are_kept() {
    let a = Lookup::ExchangeRate {
      from: "AB".into(),
      to: "C".into(),
    };
    let b = Lookup::ExchangeRate {
      from: "A".into(),
      to: "BC".into(),
    };
    assert_ne!(
      a.cache_key(Namespace::Positive),
      b.cache_key(Namespace::Positive)
    );
  }

  #[test]
  fn test_kinds_do_not_collide() {
    let sku = Lookup::availability("paris");
    let city = Lookup::weather("paris");
    assert_ne!(
      sku.cache_key(Namespace::Positive),
      city.cache_key(Namespace::Positive)
    );
  }

  #[test]
  fn test_namespaces_are_disjoint() {
    let lookup = Lookup::availability("X-404");
    let pos = lookup.cache_key(Namespace::Positive);
    let neg = lookup.cache_key(Namespace::Negative);
    assert_ne!(pos, neg);
    assert!(pos.starts_with("pos:availability:"));
    assert!(neg.starts_with("neg:availability:"));
  }

  #[test]
  fn test_sku_case_is_significant() {
    assert_ne!(
      Lookup::availability("ab-1").cache_key(Namespace::Positive),
      Lookup::availability("AB-1").cache_key(Namespace::Positive)
    );
  }
}
