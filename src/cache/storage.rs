//! Durable key/value backends: SQLite, in-memory, and no-op.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::KeyValueStore;
use crate::error::StorageError;

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopKvStore;

impl KeyValueStore for NoopKvStore {
  fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
    Ok(None) // Always miss
  }

  fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
    Ok(Vec::new())
  }
}

/// Map-backed store with an optional byte quota.
///
/// Usage is counted as `key.len() + value.len()` per item.
#[derive(Default)]
pub struct MemoryKvStore {
  items: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      items: Mutex::new(BTreeMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  pub fn used_bytes(&self) -> usize {
    self
      .items
      .lock()
      .map(|items| items.iter().map(|(k, v)| k.len() + v.len()).sum())
      .unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    self.items.lock().map(|items| items.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl KeyValueStore for MemoryKvStore {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
    let items = self
      .items
      .lock()
      .map_err(|e| StorageError::Unavailable(e.to_string()))?;
    Ok(items.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| StorageError::Unavailable(e.to_string()))?;

    if let Some(quota) = self.quota_bytes {
      let used: usize = items.iter().map(|(k, v)| k.len() + v.len()).sum();
      let replaced = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
      let next = used - replaced + key.len() + value.len();
      if next > quota {
        return Err(StorageError::QuotaExceeded { used: next, quota });
      }
    }

    items.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<(), StorageError> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| StorageError::Unavailable(e.to_string()))?;
    items.remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let items = self
      .items
      .lock()
      .map_err(|e| StorageError::Unavailable(e.to_string()))?;
    Ok(
      items
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }
}

/// SQLite-based durable store.
pub struct SqliteKvStore {
  conn: Mutex<Connection>,
  quota_bytes: Option<usize>,
}

impl SqliteKvStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a store that lives only as long as this process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Cap the total size of stored keys and values.
  pub fn with_quota(mut self, quota_bytes: usize) -> Self {
    self.quota_bytes = Some(quota_bytes);
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swrc").join("cache.db"))
  }

  /// Run database migrations for the store table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(e.to_string()))
  }
}

/// Schema for the durable store.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteKvStore {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.conn()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let conn = self.conn()?;

    if let Some(quota) = self.quota_bytes {
      // Sizes in bytes, not characters
      let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
         FROM kv_store WHERE key != ?",
        params![key],
        |row| row.get(0),
      )?;
      let next = used as usize + key.len() + value.len();
      if next > quota {
        return Err(StorageError::QuotaExceeded { used: next, quota });
      }
    }

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.conn()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let conn = self.conn()?;
    let mut stmt =
      conn.prepare("SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1")?;
    let keys = stmt
      .query_map(params![prefix], |row| row.get::<_, String>(0))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
  }
}
