//! Core types for the caching system.

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FetchError, StorageError};

/// A cached value together with the time it was written.
///
/// Data is held as JSON so one store can serve every value type; consumers
/// decode it with [`CacheEntry::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub data: Value,
  /// Epoch milliseconds
  pub timestamp: i64,
}

impl CacheEntry {
  pub fn new(data: Value, timestamp: i64) -> Self {
    Self { data, timestamp }
  }

  /// Encode a typed value into an entry.
  pub fn encode<T: Serialize>(data: &T, timestamp: i64) -> Result<Self, FetchError> {
    let data = serde_json::to_value(data).map_err(|e| FetchError::Decode(e.to_string()))?;
    Ok(Self { data, timestamp })
  }

  /// Decode the entry's data into `T`.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
    T::deserialize(&self.data).map_err(|e| FetchError::Decode(e.to_string()))
  }

  /// Age of the entry relative to `now_ms`.
  pub fn age_ms(&self, now_ms: i64) -> i64 {
    now_ms - self.timestamp
  }

  /// Whether the entry is older than `ttl_ms`.
  pub fn is_stale(&self, now_ms: i64, ttl_ms: u64) -> bool {
    self.age_ms(now_ms) > i64::try_from(ttl_ms).unwrap_or(i64::MAX)
  }

  pub fn cached_at(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.timestamp).single()
  }
}

/// Synchronous, capacity-bounded string key/value store.
///
/// This is the durable tier of the cache. Implementations must report
/// capacity failures as [`StorageError::QuotaExceeded`] so the cache can evict
/// and retry.
pub trait KeyValueStore: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

  fn remove_item(&self, key: &str) -> Result<(), StorageError>;

  /// All keys starting with `prefix`, in no particular order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_staleness_is_strictly_greater() {
    let entry = CacheEntry::new(json!(1), 10_000);
    assert!(!entry.is_stale(11_000, 1000));
    assert!(entry.is_stale(11_001, 1000));
  }

  #[test]
  fn test_decode_mismatch_is_decode_error() {
    let entry = CacheEntry::new(json!("not a number"), 0);
    let result: Result<u32, _> = entry.decode();
    assert!(matches!(result, Err(FetchError::Decode(_))));
  }

  #[test]
  fn test_serialized_shape() {
    let entry = CacheEntry::encode(&vec!["a", "b"], 42).unwrap();
    let text = serde_json::to_string(&entry).unwrap();
    assert_eq!(text, r#"{"data":["a","b"],"timestamp":42}"#);
  }
}
