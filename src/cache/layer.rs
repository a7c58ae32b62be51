//! Two-tier cache store: an authoritative in-memory map mirrored into a
//! durable key/value backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::traits::{CacheEntry, KeyValueStore};
use crate::error::StorageError;
use crate::sync::lock;

/// Namespace for cache entries in the durable tier.
pub const DURABLE_PREFIX: &str = "swr:";

/// Share of namespaced durable keys evicted when a write hits the quota.
const EVICTION_FRACTION: f64 = 0.3;

/// Cache store layered over an in-memory map and a durable backend.
///
/// The memory tier is authoritative for the running process. The durable tier
/// lets a fresh process render the last known value instantly. Durable failures
/// never reach callers.
pub struct PersistentCacheStore {
  memory: Mutex<HashMap<String, CacheEntry>>,
  durable: Arc<dyn KeyValueStore>,
  /// Serializes durable writes so the mirror never goes back to an older entry
  durable_writes: Mutex<()>,
}

impl PersistentCacheStore {
  pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
    Self {
      memory: Mutex::new(HashMap::new()),
      durable,
      durable_writes: Mutex::new(()),
    }
  }

  /// Look up `key`, promoting a durable hit into memory.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    if let Some(entry) = lock(&self.memory).get(key) {
      return Some(entry.clone());
    }

    let raw = match self.durable.get_item(&durable_key(key)) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, "Durable cache read failed: {}", e);
        return None;
      }
    };

    match serde_json::from_str::<CacheEntry>(&raw) {
      Ok(entry) => {
        debug!(key, "Promoted durable cache entry into memory");
        // A concurrent write may have landed while we were reading; keep it.
        let mut memory = lock(&self.memory);
        Some(
          memory
            .entry(key.to_string())
            .or_insert(entry)
            .clone(),
        )
      }
      Err(e) => {
        warn!(key, "Discarding undecodable durable cache entry: {}", e);
        None
      }
    }
  }

  /// Write-through to both tiers.
  ///
  /// With `persist` off only memory is written and any older durable copy is
  /// dropped, so a later process cannot revive it.
  pub fn set(&self, key: &str, entry: CacheEntry, persist: bool) {
    self.set_memory(key, entry);
    self.flush(key, persist);
  }

  /// Replace the memory entry for `key` without touching the durable tier.
  pub(crate) fn set_memory(&self, key: &str, entry: CacheEntry) {
    lock(&self.memory).insert(key.to_string(), entry);
  }

  /// Mirror the current memory entry for `key` into the durable tier.
  ///
  /// Always writes the latest entry, so flushes that finish out of order
  /// still leave the newest value on disk.
  pub(crate) fn flush(&self, key: &str, persist: bool) {
    let _writing = lock(&self.durable_writes);

    if !persist {
      if let Err(e) = self.durable.remove_item(&durable_key(key)) {
        warn!(key, "Failed to drop durable cache entry: {}", e);
      }
      return;
    }

    let Some(entry) = lock(&self.memory).get(key).cloned() else {
      // Invalidated before the flush ran
      return;
    };
    match serde_json::to_string(&entry) {
      Ok(serialized) => self.write_durable(key, &serialized),
      Err(e) => warn!(key, "Failed to serialize cache entry: {}", e),
    }
  }

  /// Remove every entry whose key starts with `prefix` from both tiers.
  ///
  /// Returns the keys removed from either tier.
  pub fn delete_by_prefix(&self, prefix: &str) -> Vec<String> {
    let mut removed: Vec<String> = {
      let mut memory = lock(&self.memory);
      let keys: Vec<String> = memory
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      for k in &keys {
        memory.remove(k);
      }
      keys
    };

    let _writing = lock(&self.durable_writes);
    match self
      .durable
      .keys_with_prefix(&durable_key(prefix))
    {
      Ok(keys) => {
        for durable in keys {
          if let Err(e) = self.durable.remove_item(&durable) {
            warn!(key = %durable, "Failed to remove durable cache entry: {}", e);
            continue;
          }
          let key = durable[DURABLE_PREFIX.len()..].to_string();
          if !removed.contains(&key) {
            removed.push(key);
          }
        }
      }
      Err(e) => warn!(prefix, "Failed to list durable cache entries: {}", e),
    }

    debug!(prefix, count = removed.len(), "Invalidated cache entries");
    removed
  }

  fn write_durable(&self, key: &str, serialized: &str) {
    let durable = durable_key(key);
    match self.durable.set_item(&durable, serialized) {
      Ok(()) => {}
      Err(StorageError::QuotaExceeded { used, quota }) => {
        warn!(key, used, quota, "Durable cache full, evicting");
        self.evict_oldest();
        if let Err(e) = self.durable.set_item(&durable, serialized) {
          warn!(key, "Dropping durable cache write after eviction: {}", e);
        }
      }
      Err(e) => warn!(key, "Dropping durable cache write: {}", e),
    }
  }

  /// Evict the first 30% (rounded up) of namespaced durable keys.
  ///
  /// Keys are ordered lexicographically as a cheap, deterministic stand-in
  /// for age.
  fn evict_oldest(&self) {
    let mut keys = match self.durable.keys_with_prefix(DURABLE_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!("Failed to list durable cache entries for eviction: {}", e);
        return;
      }
    };
    keys.sort();

    let count = (keys.len() as f64 * EVICTION_FRACTION).ceil() as usize;
    for key in keys.iter().take(count) {
      if let Err(e) = self.durable.remove_item(key) {
        warn!(key = %key, "Failed to evict durable cache entry: {}", e);
      }
    }
    debug!(evicted = count, total = keys.len(), "Evicted durable cache entries");
  }
}

fn durable_key(key: &str) -> String {
  format!("{}{}", DURABLE_PREFIX, key)
}
