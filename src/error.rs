//! Error types for the cache layer.

use thiserror::Error;

/// Error surfaced to consumers of a key when fetching fails.
///
/// Cloneable so a single failed fetch can be handed to every deduplicated caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The fetch function kept failing until retries were exhausted
  #[error("fetch failed after {attempts} attempt(s): {message}")]
  Failed { attempts: u32, message: String },
  /// The task running the fetch died before producing a result
  #[error("fetch task aborted: {0}")]
  Aborted(String),
  /// The value could not be converted to or from the requested type
  #[error("failed to decode cached value: {0}")]
  Decode(String),
}

impl FetchError {
  pub(crate) fn failed(attempts: u32, error: &color_eyre::Report) -> Self {
    FetchError::Failed {
      attempts,
      message: format!("{:#}", error),
    }
  }
}

/// Error reported by a durable key/value backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
  /// The write would exceed the store's capacity
  #[error("storage quota exceeded ({used} of {quota} bytes)")]
  QuotaExceeded { used: usize, quota: usize },
  /// Any other backend failure
  #[error("storage backend error: {0}")]
  Backend(String),
  /// The store's lock was poisoned by a panicking writer
  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}
