//! Offline-first stale-while-revalidate caching for API clients.
//!
//! Cached data is returned immediately while a background fetch refreshes it.
//! Entries survive restarts through a durable key/value store, concurrent
//! fetches for one key are collapsed into one, and how long an entry stays
//! fresh scales with the current network quality.

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod network;
pub mod paginated;
pub mod swr;
mod sync;

pub use error::{FetchError, StorageError};
pub use network::{NetworkStatus, Quality};
pub use paginated::{CursorPage, PaginatedQuery};
pub use swr::{Query, QueryOptions, QueryState, SwrClient};
