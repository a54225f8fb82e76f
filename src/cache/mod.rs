//! TTL cache storage and the key codec.
//!
//! This module is payload-agnostic:
//! - Keys come from [`Lookup::cache_key`], split into positive and negative namespaces
//! - Values are opaque bytes with a per-entry expiry checked on every read
//! - Backends: SQLite file (shared across processes), in-process map, or nothing at all

mod clock;
mod key;
mod sqlite;
mod store;

#[cfg(test)]
pub use clock::ManualClock;
pub use key::{Lookup, Namespace};
pub use sqlite::SqliteStore;
pub use store::{CacheEntry, CacheStore, FlushConfirmation, MemoryStore, NoopStore};
