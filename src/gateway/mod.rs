//! Cached upstream gateway: cache-aside fetches with in-flight de-duplication,
//! exposed as typed lookups.

mod coordinator;
mod providers;

pub use coordinator::{CachePolicy, FetchCoordinator, FetchResult};
pub use providers::Gateway;
