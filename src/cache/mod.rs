//! Persistent cache store for offline-first rendering.
//!
//! This module provides a type-agnostic two-tier store that:
//! - Keeps an authoritative in-memory map for the running process
//! - Mirrors entries into a durable key/value backend under `swr:<key>`
//! - Evicts the oldest 30% of durable keys when the backend runs out of quota
//! - Invalidates by key prefix across both tiers

mod layer;
mod storage;
mod traits;

pub use layer::{PersistentCacheStore, DURABLE_PREFIX};
pub use storage::{MemoryKvStore, NoopKvStore, SqliteKvStore};
pub use traits::{CacheEntry, KeyValueStore};
