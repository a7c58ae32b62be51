//! Request deduplication and retry with exponential backoff.
//!
//! Concurrent requests for the same key share one physical fetch. The fetch
//! runs on its own task, so it finishes (and its result can still be cached)
//! even if every caller has gone away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::sync::lock;

/// Delay before the first retry.
pub const BASE_BACKOFF: Duration = Duration::from_millis(1000);

/// Upper bound for any single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(8000);

/// Delay after the failed attempt with 0-based index `attempt`:
/// `min(1000ms * 2^attempt, 8000ms)`.
pub fn backoff_delay(attempt: u32) -> Duration {
  let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
  let millis = (BASE_BACKOFF.as_millis() as u64).saturating_mul(factor);
  Duration::from_millis(millis.min(MAX_BACKOFF.as_millis() as u64))
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

struct InFlight<V> {
  id: u64,
  generation: u64,
  future: SharedFetch<V>,
}

enum Slot<V> {
  /// Await this fetch and return its result
  Join(SharedFetch<V>),
  /// An older-generation fetch is running; wait for it, then try again
  Wait(SharedFetch<V>),
}

/// Deduplicates concurrent fetches per key and retries failures.
pub struct RequestCoordinator<V> {
  inflight: Arc<Mutex<HashMap<String, InFlight<V>>>>,
  next_id: AtomicU64,
}

impl<V> Default for RequestCoordinator<V>
where
  V: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<V> RequestCoordinator<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      inflight: Arc::new(Mutex::new(HashMap::new())),
      next_id: AtomicU64::new(0),
    }
  }

  /// Fetch `key`, joining an outstanding fetch for the same key if any.
  ///
  /// Failures are retried `retries` times with [`backoff_delay`] between
  /// attempts; once exhausted the error reaches every joined caller.
  pub async fn fetch_deduped<F, Fut>(
    &self,
    key: &str,
    retries: u32,
    fetcher: F,
  ) -> Result<V, FetchError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<V>> + Send + 'static,
  {
    self.fetch_at_generation(key, 0, retries, fetcher).await
  }

  /// Like [`fetch_deduped`](Self::fetch_deduped), but only joins an outstanding
  /// fetch dispatched at `generation` or later. An older fetch is awaited and a
  /// fresh one started afterwards, so there is still never more than one
  /// physical fetch per key.
  pub async fn fetch_at_generation<F, Fut>(
    &self,
    key: &str,
    generation: u64,
    retries: u32,
    fetcher: F,
  ) -> Result<V, FetchError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<V>> + Send + 'static,
  {
    let fetcher = Arc::new(fetcher);

    loop {
      let slot = {
        let mut inflight = lock(&self.inflight);
        match inflight.get(key) {
          Some(existing) if existing.generation >= generation => {
            debug!(key, "Joining in-flight fetch");
            Slot::Join(existing.future.clone())
          }
          Some(existing) => Slot::Wait(existing.future.clone()),
          None => Slot::Join(self.start(
            &mut inflight,
            key,
            generation,
            retries,
            Arc::clone(&fetcher),
          )),
        }
      };

      match slot {
        Slot::Join(future) => return future.await,
        Slot::Wait(future) => {
          debug!(key, generation, "Waiting for superseded fetch to settle");
          let _ = future.await;
        }
      }
    }
  }

  /// Whether a fetch for `key` is currently outstanding.
  pub fn is_in_flight(&self, key: &str) -> bool {
    lock(&self.inflight).contains_key(key)
  }

  pub fn in_flight_count(&self) -> usize {
    lock(&self.inflight).len()
  }

  fn start<F, Fut>(
    &self,
    inflight: &mut HashMap<String, InFlight<V>>,
    key: &str,
    generation: u64,
    retries: u32,
    fetcher: Arc<F>,
  ) -> SharedFetch<V>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<V>> + Send + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let registry = Arc::clone(&self.inflight);
    let owned_key = key.to_string();

    let handle = tokio::spawn(async move {
      let result = run_with_retry(&owned_key, retries, fetcher.as_ref()).await;
      // Settled: the next request for this key starts a fresh fetch.
      let mut registry = lock(&registry);
      if registry.get(&owned_key).is_some_and(|f| f.id == id) {
        registry.remove(&owned_key);
      }
      result
    });

    let future = async move {
      handle
        .await
        .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())))
    }
    .boxed()
    .shared();

    debug!(key, generation, "Starting fetch");
    inflight.insert(
      key.to_string(),
      InFlight {
        id,
        generation,
        future: future.clone(),
      },
    );
    future
  }
}

async fn run_with_retry<V, F, Fut>(key: &str, retries: u32, fetcher: &F) -> Result<V, FetchError>
where
  F: Fn() -> Fut,
  Fut: Future<Output = color_eyre::Result<V>>,
{
  let mut attempt: u32 = 0;
  loop {
    match fetcher().await {
      Ok(value) => {
        if attempt > 0 {
          info!(key, attempts = attempt + 1, "Fetch succeeded after retrying");
        }
        return Ok(value);
      }
      Err(e) if attempt < retries => {
        let delay = backoff_delay(attempt);
        warn!(
          key,
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          "Fetch failed, retrying: {:#}",
          e
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => {
        warn!(key, attempts = attempt + 1, "Fetch failed: {:#}", e);
        return Err(FetchError::failed(attempt + 1, &e));
      }
    }
  }
}
