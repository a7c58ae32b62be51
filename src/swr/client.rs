//! The stale-while-revalidate engine.
//!
//! A [`SwrClient`] owns every piece of shared cache state: the two-tier entry
//! store, the in-flight registry, the subscriber registry and per-key
//! bookkeeping. Clones are cheap handles onto the same state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::focus::{FocusEvent, FocusEvents, FocusGate, FocusSignal};
use super::options::QueryOptions;
use super::query::Query;
use crate::cache::{CacheEntry, KeyValueStore, NoopKvStore, PersistentCacheStore};
use crate::coordinator::RequestCoordinator;
use crate::error::FetchError;
use crate::network::{ManualNetworkSignal, NetworkMonitor, NetworkSignal, NetworkStatus};
use crate::paginated::{CursorPage, PaginatedQuery};
use crate::sync::lock;

/// A fetch function with its output already encoded as JSON.
pub(crate) type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Opaque token identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct SubscriberRegistry {
  next_id: u64,
  by_key: HashMap<String, HashMap<SubscriptionId, Callback>>,
}

impl SubscriberRegistry {
  fn add(&mut self, key: &str, callback: Callback) -> SubscriptionId {
    self.next_id += 1;
    let id = SubscriptionId(self.next_id);
    self
      .by_key
      .entry(key.to_string())
      .or_default()
      .insert(id, callback);
    id
  }

  fn remove(&mut self, key: &str, id: SubscriptionId) -> bool {
    let Some(handles) = self.by_key.get_mut(key) else {
      return false;
    };
    let removed = handles.remove(&id).is_some();
    if handles.is_empty() {
      self.by_key.remove(key);
    }
    removed
  }

  fn callbacks(&self, key: &str) -> Vec<Callback> {
    self
      .by_key
      .get(key)
      .map(|handles| handles.values().cloned().collect())
      .unwrap_or_default()
  }

  fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
    self
      .by_key
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect()
  }
}

/// Per-key bookkeeping next to the cached entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyState {
  /// Bumped by every optimistic write and invalidation; older fetch results are dropped
  pub generation: u64,
  /// Bumped whenever the cached entry is replaced or removed
  pub revision: u64,
  /// Revalidations dispatched and not yet settled
  pub pending: usize,
  /// Last fetch failure, cleared by the next success
  pub error: Option<FetchError>,
}

struct Inner {
  store: PersistentCacheStore,
  coordinator: RequestCoordinator<Value>,
  subscribers: Mutex<SubscriberRegistry>,
  keys: Mutex<HashMap<String, KeyState>>,
  focus_gate: Mutex<FocusGate>,
  network: NetworkMonitor,
  focus: Arc<dyn FocusSignal>,
  defaults: QueryOptions,
  clock: Clock,
}

/// Builder for [`SwrClient`].
///
/// Without explicit capabilities the client keeps entries in memory only,
/// reports an unknown (medium) network and never sees focus events.
pub struct SwrClientBuilder {
  durable: Arc<dyn KeyValueStore>,
  network: Arc<dyn NetworkSignal>,
  focus: Arc<dyn FocusSignal>,
  defaults: QueryOptions,
  clock: Option<Clock>,
}

impl Default for SwrClientBuilder {
  fn default() -> Self {
    Self {
      durable: Arc::new(NoopKvStore),
      network: Arc::new(ManualNetworkSignal::unknown()),
      focus: Arc::new(FocusEvents::new()),
      defaults: QueryOptions::default(),
      clock: None,
    }
  }
}

impl SwrClientBuilder {
  pub fn durable(mut self, store: Arc<dyn KeyValueStore>) -> Self {
    self.durable = store;
    self
  }

  pub fn network(mut self, signal: Arc<dyn NetworkSignal>) -> Self {
    self.network = signal;
    self
  }

  pub fn focus(mut self, signal: Arc<dyn FocusSignal>) -> Self {
    self.focus = signal;
    self
  }

  /// Options used by [`SwrClient::prefetch`] and as a starting point for callers.
  pub fn defaults(mut self, defaults: QueryOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn clock(mut self, clock: Clock) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn build(self) -> SwrClient {
    SwrClient {
      inner: Arc::new(Inner {
        store: PersistentCacheStore::new(self.durable),
        coordinator: RequestCoordinator::new(),
        subscribers: Mutex::new(SubscriberRegistry::default()),
        keys: Mutex::new(HashMap::new()),
        focus_gate: Mutex::new(FocusGate::default()),
        network: NetworkMonitor::new(self.network),
        focus: self.focus,
        defaults: self.defaults,
        clock: self.clock.unwrap_or_default(),
      }),
    }
  }
}

/// Stale-while-revalidate cache client.
///
/// Concurrent writes to one key from different consumers are last-write-wins,
/// except that fetch results dispatched before an optimistic write or an
/// invalidation are discarded. Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct SwrClient {
  inner: Arc<Inner>,
}

impl SwrClient {
  pub fn builder() -> SwrClientBuilder {
    SwrClientBuilder::default()
  }

  /// Observe `key`.
  ///
  /// Cached data is available immediately; a stale or missing entry starts a
  /// background revalidation. The returned [`Query`] stays subscribed until
  /// dropped.
  pub fn get<T, F, Fut>(
    &self,
    key: impl Into<String>,
    fetcher: F,
    options: QueryOptions,
  ) -> Query<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Query::mount(self.clone(), key.into(), erase(fetcher), options)
  }

  /// Observe a cursor-paginated list whose first page is cached under `key`.
  pub fn get_paginated<T, F, Fut>(
    &self,
    key: impl Into<String>,
    fetch_page: F,
    options: QueryOptions,
  ) -> PaginatedQuery<T>
  where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CursorPage<T>>> + Send + 'static,
  {
    PaginatedQuery::mount(self, key.into(), fetch_page, options)
  }

  /// Warm the cache for `key`. Failures are swallowed.
  pub async fn prefetch<T, F, Fut>(&self, key: impl Into<String>, fetcher: F)
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.into();
    let fetcher = erase(fetcher);
    let generation = self.key_state(&key).generation;
    let result = self
      .inner
      .coordinator
      .fetch_at_generation(&key, generation, self.inner.defaults.retries, move || {
        fetcher()
      })
      .await;

    match result {
      Ok(value) => {
        if self.commit(&key, generation, value, self.inner.defaults.persist) {
          debug!(key = %key, "Prefetched");
          self.notify(&key);
        }
      }
      Err(e) => debug!(key = %key, "Prefetch failed: {}", e),
    }
  }

  /// Remove every cached entry whose key starts with `prefix`.
  ///
  /// Mounted consumers of affected keys are notified and refetch. Fetches
  /// already in flight for those keys will not repopulate the cache.
  pub fn invalidate(&self, prefix: &str) -> usize {
    let removed = self.inner.store.delete_by_prefix(prefix);
    let count = removed.len();

    let mut affected = removed;
    for key in lock(&self.inner.subscribers).keys_with_prefix(prefix) {
      if !affected.contains(&key) {
        affected.push(key);
      }
    }

    {
      let mut keys = lock(&self.inner.keys);
      for key in keys.keys() {
        if key.starts_with(prefix) && !affected.contains(key) {
          affected.push(key.clone());
        }
      }
      for key in &affected {
        let state = keys.entry(key.clone()).or_default();
        state.generation += 1;
        state.revision += 1;
        state.error = None;
      }
    }

    for key in &affected {
      self.notify(key);
    }
    info!(prefix, removed = count, "Invalidated cache");
    count
  }

  /// Write `data` for `key` from outside any consumer (e.g. a server push).
  pub fn set_cached<T: Serialize>(
    &self,
    key: &str,
    data: &T,
    persist: bool,
  ) -> std::result::Result<(), FetchError> {
    let entry = CacheEntry::encode(data, self.now_ms())?;
    self.write_optimistic(key, entry, persist);
    self.notify(key);
    Ok(())
  }

  /// Current cached value for `key`, without subscribing or fetching.
  pub fn get_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.inner.store.get(key)?;
    match entry.decode() {
      Ok(value) => Some(value),
      Err(e) => {
        debug!(key, "Cached value has a different shape: {}", e);
        None
      }
    }
  }

  pub fn network(&self) -> &NetworkMonitor {
    &self.inner.network
  }

  pub fn network_status(&self) -> NetworkStatus {
    self.inner.network.status()
  }

  pub fn defaults(&self) -> &QueryOptions {
    &self.inner.defaults
  }

  /// Register `callback` to run whenever the entry for `key` changes.
  pub fn subscribe<F>(&self, key: &str, callback: F) -> SubscriptionId
  where
    F: Fn() + Send + Sync + 'static,
  {
    lock(&self.inner.subscribers).add(key, Arc::new(callback))
  }

  pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
    lock(&self.inner.subscribers).remove(key, id)
  }

  pub fn subscriber_count(&self, key: &str) -> usize {
    lock(&self.inner.subscribers)
      .by_key
      .get(key)
      .map(HashMap::len)
      .unwrap_or(0)
  }

  /// Base TTL scaled by the current network quality.
  pub fn effective_ttl(&self, base: Duration) -> Duration {
    base.saturating_mul(self.network_status().cache_ttl_multiplier)
  }

  pub(crate) fn now_ms(&self) -> i64 {
    self.inner.clock.now_ms()
  }

  pub(crate) fn entry(&self, key: &str) -> Option<CacheEntry> {
    self.inner.store.get(key)
  }

  pub(crate) fn key_state(&self, key: &str) -> KeyState {
    lock(&self.inner.keys).get(key).cloned().unwrap_or_default()
  }

  pub(crate) fn focus_signal(&self) -> &Arc<dyn FocusSignal> {
    &self.inner.focus
  }

  /// `None` when nothing is cached for `key`.
  pub(crate) fn is_stale(&self, key: &str, ttl: Duration) -> Option<bool> {
    let entry = self.inner.store.get(key)?;
    let ttl_ms = self.effective_ttl(ttl).as_millis() as u64;
    Some(entry.is_stale(self.now_ms(), ttl_ms))
  }

  /// An entry that disappeared without a failure or fetch to explain it.
  pub(crate) fn needs_refetch(&self, key: &str) -> bool {
    let state = self.key_state(key);
    state.pending == 0 && state.error.is_none() && self.inner.store.get(key).is_none()
  }

  pub(crate) fn admit_focus(&self, event: FocusEvent) -> bool {
    let throttle = self.network_status().policy().focus_throttle;
    let now = self.now_ms();
    lock(&self.inner.focus_gate).admit(event, now, throttle)
  }

  /// Start a background revalidation of `key`.
  ///
  /// The key counts as revalidating from this call until the fetch settles.
  pub(crate) fn spawn_revalidate(
    &self,
    key: &str,
    fetcher: ErasedFetcher,
    options: &QueryOptions,
  ) -> JoinHandle<std::result::Result<(), FetchError>> {
    let generation = {
      let mut keys = lock(&self.inner.keys);
      let state = keys.entry(key.to_string()).or_default();
      state.pending += 1;
      state.generation
    };
    self.notify(key);

    let client = self.clone();
    let key = key.to_string();
    let retries = options.retries;
    let persist = options.persist;
    tokio::spawn(async move {
      let result = client
        .inner
        .coordinator
        .fetch_at_generation(&key, generation, retries, move || fetcher())
        .await;
      client.settle(&key, generation, persist, result)
    })
  }

  pub(crate) async fn revalidate(
    &self,
    key: &str,
    fetcher: ErasedFetcher,
    options: &QueryOptions,
  ) -> std::result::Result<(), FetchError> {
    self
      .spawn_revalidate(key, fetcher, options)
      .await
      .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())))
  }

  /// Optimistically replace the cached value, then reconcile in the background.
  pub(crate) fn mutate(
    &self,
    key: &str,
    data: Option<Value>,
    fetcher: ErasedFetcher,
    options: &QueryOptions,
  ) {
    if let Some(value) = data {
      let entry = CacheEntry::new(value, self.now_ms());
      self.write_optimistic(key, entry, options.persist);
      debug!(key, "Applied optimistic update");
      self.notify(key);
    }
    let _ = self.spawn_revalidate(key, fetcher, options);
  }

  fn write_optimistic(&self, key: &str, entry: CacheEntry, persist: bool) {
    {
      let mut keys = lock(&self.inner.keys);
      let state = keys.entry(key.to_string()).or_default();
      state.generation += 1;
      state.revision += 1;
      self.inner.store.set_memory(key, entry);
    }
    self.inner.store.flush(key, persist);
  }

  fn settle(
    &self,
    key: &str,
    generation: u64,
    persist: bool,
    result: std::result::Result<Value, FetchError>,
  ) -> std::result::Result<(), FetchError> {
    let outcome = {
      let mut keys = lock(&self.inner.keys);
      let state = keys.entry(key.to_string()).or_default();
      state.pending = state.pending.saturating_sub(1);

      match result {
        Ok(value) if state.generation == generation => {
          self.store_fetched(state, key, value);
          info!(key, "Revalidated");
          Ok(true)
        }
        Ok(_) => {
          debug!(key, generation, "Dropping result of superseded fetch");
          Ok(false)
        }
        Err(e) => {
          if state.generation == generation {
            state.error = Some(e.clone());
          }
          warn!(key, "Revalidation failed, keeping cached data: {}", e);
          Err(e)
        }
      }
    };

    if let Ok(true) = outcome {
      self.inner.store.flush(key, persist);
    }
    self.notify(key);
    outcome.map(|_| ())
  }

  /// Store a fetched value unless a newer write superseded its fetch.
  fn commit(&self, key: &str, generation: u64, value: Value, persist: bool) -> bool {
    {
      let mut keys = lock(&self.inner.keys);
      let state = keys.entry(key.to_string()).or_default();
      if state.generation != generation {
        return false;
      }
      self.store_fetched(state, key, value);
    }
    self.inner.store.flush(key, persist);
    true
  }

  /// Memory-tier half of a fetched write; callers flush to the durable tier
  /// once the key lock is released.
  fn store_fetched(&self, state: &mut KeyState, key: &str, value: Value) {
    state.error = None;
    state.revision += 1;
    self
      .inner
      .store
      .set_memory(key, CacheEntry::new(value, self.now_ms()));
  }

  pub(crate) fn notify(&self, key: &str) {
    let callbacks = lock(&self.inner.subscribers).callbacks(key);
    for callback in callbacks {
      callback();
    }
  }
}

/// Wrap a typed fetch function so its output is stored as JSON.
pub(crate) fn erase<T, F, Fut>(fetcher: F) -> ErasedFetcher
where
  T: Serialize + Send + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move || {
    let fut = fetcher();
    async move {
      let value = fut.await?;
      serde_json::to_value(value).map_err(|e| eyre!("Failed to encode fetched value: {}", e))
    }
    .boxed()
  })
}
