//! Consumer handle for one cache key.
//!
//! Inspired by TanStack Query: a [`Query<T>`] is what a view holds on to. It
//! subscribes to its key on creation, exposes the shared entry plus loading
//! and error flags, and releases its subscription and triggers when dropped.
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let mut query = client.get(
//!     "okr:acme:2024-q3",
//!     move || {
//!         let api = api.clone();
//!         async move { api.objectives("acme", "2024-q3").await }
//!     },
//!     QueryOptions::default(),
//! );
//!
//! // Render whatever is cached right now
//! render(query.state());
//!
//! // Re-render on every update to the key
//! while query.changed().await {
//!     render(query.state());
//! }
//! ```

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::client::{ErasedFetcher, SubscriptionId, SwrClient};
use super::options::QueryOptions;
use super::scheduler;
use crate::error::FetchError;

/// Snapshot of a key as seen by one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
  /// Last known good data, kept through failed revalidations
  pub data: Option<T>,
  pub error: Option<FetchError>,
  /// A fetch for the key is in flight
  pub loading: bool,
  /// Fetching with nothing cached to show
  pub is_initial_loading: bool,
  /// Fetching in the background while cached data is shown
  pub is_revalidating: bool,
  /// When the shown data was written
  pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QueryState<T> {
  fn idle() -> Self {
    Self {
      data: None,
      error: None,
      loading: false,
      is_initial_loading: false,
      is_revalidating: false,
      updated_at: None,
    }
  }
}

/// A mounted consumer of one cache key.
pub struct Query<T> {
  client: SwrClient,
  /// `None` when the query is skipped
  key: Option<String>,
  options: QueryOptions,
  fetcher: ErasedFetcher,
  subscription: Option<SubscriptionId>,
  updates: watch::Receiver<u64>,
  scheduler: Option<JoinHandle<()>>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  pub(crate) fn mount(
    client: SwrClient,
    key: String,
    fetcher: ErasedFetcher,
    options: QueryOptions,
  ) -> Self {
    let (tx, updates) = watch::channel(0u64);

    if options.skip {
      return Self {
        client,
        key: None,
        options,
        fetcher,
        subscription: None,
        updates,
        scheduler: None,
        _marker: PhantomData,
      };
    }

    let subscription = client.subscribe(&key, move || {
      tx.send_modify(|version| *version = version.wrapping_add(1));
    });

    match client.is_stale(&key, options.ttl) {
      Some(false) => debug!(key = %key, "Serving fresh cache entry"),
      Some(true) => {
        debug!(key = %key, "Serving stale cache entry, revalidating");
        let _ = client.spawn_revalidate(&key, fetcher.clone(), &options);
      }
      None => {
        debug!(key = %key, "Cache miss, fetching");
        let _ = client.spawn_revalidate(&key, fetcher.clone(), &options);
      }
    }

    let scheduler = scheduler::spawn(
      client.clone(),
      key.clone(),
      fetcher.clone(),
      options.clone(),
      updates.clone(),
    );

    Self {
      client,
      key: Some(key),
      options,
      fetcher,
      subscription: Some(subscription),
      updates,
      scheduler: Some(scheduler),
      _marker: PhantomData,
    }
  }

  pub fn key(&self) -> Option<&str> {
    self.key.as_deref()
  }

  pub fn options(&self) -> &QueryOptions {
    &self.options
  }

  /// Current view of the shared entry.
  pub fn state(&self) -> QueryState<T> {
    let Some(key) = &self.key else {
      return QueryState::idle();
    };

    let entry = self.client.entry(key);
    let key_state = self.client.key_state(key);

    let (data, decode_error) = match entry.as_ref().map(|e| e.decode::<T>()) {
      Some(Ok(data)) => (Some(data), None),
      Some(Err(e)) => (None, Some(e)),
      None => (None, None),
    };
    let fetching = key_state.pending > 0;

    QueryState {
      is_initial_loading: fetching && data.is_none(),
      is_revalidating: fetching && data.is_some(),
      loading: fetching,
      error: key_state.error.or(decode_error),
      updated_at: entry.and_then(|e| e.cached_at()),
      data,
    }
  }

  pub fn data(&self) -> Option<T> {
    let key = self.key.as_deref()?;
    self.client.entry(key)?.decode().ok()
  }

  pub fn error(&self) -> Option<FetchError> {
    self.state().error
  }

  pub fn is_loading(&self) -> bool {
    self.state().loading
  }

  pub fn is_initial_loading(&self) -> bool {
    self.state().is_initial_loading
  }

  pub fn is_revalidating(&self) -> bool {
    self.state().is_revalidating
  }

  /// Optimistically replace the cached value and reconcile in the background.
  ///
  /// With `None` this only triggers the background revalidation. The new
  /// value is visible to every consumer of the key before this returns.
  pub fn mutate(&self, data: Option<T>) -> Result<(), FetchError> {
    let Some(key) = &self.key else {
      return Ok(());
    };
    let value = data
      .map(|d| serde_json::to_value(d).map_err(|e| FetchError::Decode(e.to_string())))
      .transpose()?;
    self
      .client
      .mutate(key, value, self.fetcher.clone(), &self.options);
    Ok(())
  }

  /// Revalidate now and wait for the outcome.
  pub async fn revalidate(&self) -> Result<(), FetchError> {
    let Some(key) = &self.key else {
      return Ok(());
    };
    self
      .client
      .revalidate(key, self.fetcher.clone(), &self.options)
      .await
  }

  /// Wait until the key's entry or status changes.
  ///
  /// Returns `false` when the query is skipped and will never change.
  pub async fn changed(&mut self) -> bool {
    self.updates.changed().await.is_ok()
  }

  /// Revision of the shared entry; changes whenever the entry is replaced.
  pub(crate) fn revision(&self) -> u64 {
    self
      .key
      .as_deref()
      .map(|key| self.client.key_state(key).revision)
      .unwrap_or(0)
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    if let Some(scheduler) = self.scheduler.take() {
      scheduler.abort();
    }
    if let (Some(key), Some(id)) = (&self.key, self.subscription.take()) {
      self.client.unsubscribe(key, id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{KeyValueStore, MemoryKvStore};
  use crate::network::{ConnectionInfo, ManualNetworkSignal, NetworkInfo};
  use crate::swr::clock::Clock;
  use crate::swr::focus::FocusEvents;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn connection(effective_type: &str) -> NetworkInfo {
    NetworkInfo::with_connection(ConnectionInfo {
      effective_type: Some(effective_type.to_string()),
      downlink_mbps: Some(10.0),
      rtt_ms: Some(50),
      save_data: false,
    })
  }

  struct Harness {
    client: SwrClient,
    durable: Arc<MemoryKvStore>,
    network: Arc<ManualNetworkSignal>,
    focus: FocusEvents,
  }

  fn harness(info: NetworkInfo) -> Harness {
    let durable = Arc::new(MemoryKvStore::new());
    let network = Arc::new(ManualNetworkSignal::new(info));
    let focus = FocusEvents::new();
    let client = SwrClient::builder()
      .durable(durable.clone())
      .network(network.clone())
      .focus(Arc::new(focus.clone()))
      .clock(Clock::starting_at(1_700_000_000_000))
      .build();
    Harness {
      client,
      durable,
      network,
      focus,
    }
  }

  /// Fetcher returning `value` and counting invocations.
  fn counting(
    calls: &Arc<AtomicU32>,
    value: &'static str,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, color_eyre::Result<String>>
       + Send
       + Sync
       + 'static {
    let calls = calls.clone();
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async move { Ok(value.to_string()) })
    }
  }

  async fn settle() {
    for _ in 0..20 {
      tokio::task::yield_now().await;
    }
  }

  fn ttl(ms: u64) -> QueryOptions {
    QueryOptions::default().with_ttl(Duration::from_millis(ms))
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_gets_fetch_once() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));

    let slow = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(vec!["TASK-1".to_string()])
        }
      }
    };

    let queries: Vec<Query<Vec<String>>> = (0..5)
      .map(|_| h.client.get("tasks:inbox", slow.clone(), QueryOptions::default()))
      .collect();

    assert!(queries[0].is_initial_loading());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for query in &queries {
      assert_eq!(query.data(), Some(vec!["TASK-1".to_string()]));
      assert!(!query.is_loading());
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_is_not_revalidated_before_ttl() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));

    h.client.prefetch("okr:acme:q3", counting(&calls, "v1")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(999)).await;
    let query: Query<String> = h.client.get("okr:acme:q3", counting(&calls, "v2"), ttl(1000));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(query.data(), Some("v1".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_served_then_revalidated() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));

    h.client.prefetch("okr:acme:q3", counting(&calls, "v1")).await;
    tokio::time::advance(Duration::from_millis(1001)).await;

    let query: Query<String> = h.client.get("okr:acme:q3", counting(&calls, "v2"), ttl(1000));
    // Stale data is shown right away while the refresh runs
    let state = query.state();
    assert_eq!(state.data, Some("v1".to_string()));
    assert!(state.is_revalidating);
    assert!(!state.is_initial_loading);

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query.data(), Some("v2".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_network_stretches_ttl() {
    let h = harness(connection("2g"));
    let calls = Arc::new(AtomicU32::new(0));

    h.client.prefetch("sprint:42", counting(&calls, "v1")).await;

    tokio::time::advance(Duration::from_millis(4999)).await;
    {
      let _query: Query<String> = h.client.get("sprint:42", counting(&calls, "v2"), ttl(1000));
      settle().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    let _query: Query<String> = h.client.get("sprint:42", counting(&calls, "v2"), ttl(1000));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_recovery_revalidates_stale_entry() {
    let h = harness(NetworkInfo::offline());
    let calls = Arc::new(AtomicU32::new(0));

    h.client.set_cached("wiki:home", &"cached".to_string(), true).unwrap();
    tokio::time::advance(Duration::from_millis(5_000)).await;

    // Offline: 1s base TTL is stretched to 10s, so still fresh
    let query: Query<String> = h.client.get("wiki:home", counting(&calls, "online"), ttl(1000));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    h.network.set(connection("4g"));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(query.data(), Some("online".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutate_is_visible_to_all_subscribers_immediately() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));

    let server = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_secs(1)).await;
          Ok("server".to_string())
        }
      }
    };

    let first: Query<String> = h.client.get("task:7", server.clone(), QueryOptions::default());
    let mut second: Query<String> =
      h.client.get("task:7", server.clone(), QueryOptions::default());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    first.mutate(Some("renamed".to_string())).unwrap();
    assert_eq!(first.data(), Some("renamed".to_string()));
    assert_eq!(second.data(), Some("renamed".to_string()));
    assert!(second.changed().await);

    // One background reconciliation for the mutate, nothing from the second consumer
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(second.data(), Some("server".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_fetch_does_not_revert_optimistic_value() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));

    let server = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move {
          let n = calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok(if n == 0 { "before-edit" } else { "after-edit" }.to_string())
        }
      }
    };

    let query: Query<String> = h.client.get("task:9", server, QueryOptions::default());
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.mutate(Some("local-edit".to_string())).unwrap();

    // The pre-edit fetch lands at ~100ms and must be dropped
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(query.data(), Some("local-edit".to_string()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(query.data(), Some("after-edit".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_revalidation_keeps_data() {
    let h = harness(connection("4g"));
    h.client.set_cached("board:3", &"cached".to_string(), true).unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;

    let query: Query<String> = h.client.get(
      "board:3",
      || async { Err(eyre!("502 Bad Gateway")) },
      ttl(1000).with_retries(0),
    );
    settle().await;

    let state = query.state();
    assert_eq!(state.data, Some("cached".to_string()));
    assert!(matches!(
      state.error,
      Some(FetchError::Failed { attempts: 1, .. })
    ));
    assert!(!state.loading);
  }

  #[tokio::test(start_paused = true)]
  async fn test_initial_failure_surfaces_error_without_data() {
    let h = harness(connection("4g"));
    let query: Query<String> = h.client.get(
      "board:4",
      || async { Err(eyre!("offline")) },
      QueryOptions::default().with_retries(1),
    );
    tokio::time::sleep(Duration::from_secs(2)).await;

    let state = query.state();
    assert_eq!(state.data, None);
    assert!(matches!(
      state.error,
      Some(FetchError::Failed { attempts: 2, .. })
    ));
    assert!(!state.is_initial_loading);
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_clears_error() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));
    let flaky = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move {
          if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(eyre!("timeout"))
          } else {
            Ok(3u32)
          }
        }
      }
    };

    let options = QueryOptions::default().with_retries(0);
    let query: Query<u32> = h.client.get("okr:count", flaky, options);
    settle().await;
    assert!(query.error().is_some());

    query.revalidate().await.unwrap();
    assert_eq!(query.data(), Some(3));
    assert_eq!(query.error(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_persisted_entry_survives_new_client() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));
    h.client.prefetch("wiki:page:1", counting(&calls, "body")).await;

    let reloaded = SwrClient::builder()
      .durable(h.durable.clone())
      .network(h.network.clone())
      .build();
    assert_eq!(
      reloaded.get_cached::<String>("wiki:page:1"),
      Some("body".to_string())
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_persist_off_stays_in_memory() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));
    let query: Query<String> = h.client.get(
      "inbox:draft",
      counting(&calls, "draft"),
      QueryOptions::default().with_persist(false),
    );
    settle().await;

    assert_eq!(query.data(), Some("draft".to_string()));
    assert!(h.durable.get_item("swr:inbox:draft").unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_revalidation_and_mutate_reach_durable_tier() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));
    let query: Query<String> =
      h.client
        .get("wiki:page:2", counting(&calls, "server"), QueryOptions::default());
    settle().await;
    assert_eq!(
      h.client.get_cached::<String>("wiki:page:2"),
      Some("server".to_string())
    );
    assert!(h.durable.get_item("swr:wiki:page:2").unwrap().is_some());

    // Bookkeeping stays usable right after the durable write
    assert_eq!(h.client.key_state("wiki:page:2").pending, 0);
    query.mutate(Some("edited".to_string())).unwrap();
    let raw = h.durable.get_item("swr:wiki:page:2").unwrap().unwrap();
    assert!(raw.contains("edited"), "durable copy follows the optimistic write: {}", raw);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unpersisted_write_drops_older_durable_copy() {
    let h = harness(connection("4g"));
    h.client.set_cached("inbox:7", &"saved".to_string(), true).unwrap();
    h.client.set_cached("inbox:7", &"unsaved".to_string(), false).unwrap();

    assert!(h.durable.get_item("swr:inbox:7").unwrap().is_none());
    let reloaded = SwrClient::builder().durable(h.durable.clone()).build();
    assert_eq!(reloaded.get_cached::<String>("inbox:7"), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_skip_never_fetches() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));
    let mut query: Query<String> = h.client.get(
      "okr:none",
      counting(&calls, "x"),
      QueryOptions::default().with_skip(true),
    );
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(query.key(), None);
    assert_eq!(query.state(), QueryState::idle());
    assert!(!query.changed().await);
    query.mutate(Some("ignored".to_string())).unwrap();
    assert_eq!(h.client.subscriber_count("okr:none"), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_unsubscribes_and_stops_interval() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_refresh_interval(Duration::from_secs(5));

    let query: Query<String> = h.client.get("sprint:burndown", counting(&calls, "x"), options);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.client.subscriber_count("sprint:burndown"), 1);

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    drop(query);
    assert_eq!(h.client.subscriber_count("sprint:burndown"), 0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_focus_revalidates_once_per_throttle_window() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));

    let _a: Query<String> = h.client.get("okr:a", counting(&calls, "a"), QueryOptions::default());
    let _b: Query<String> = h.client.get("okr:b", counting(&calls, "b"), QueryOptions::default());
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Both consumers react to the same focus event
    h.focus.focus_gained();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // Alt-tabbing again within 30s on a fast connection does nothing
    tokio::time::advance(Duration::from_secs(10)).await;
    h.focus.focus_gained();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    tokio::time::advance(Duration::from_secs(21)).await;
    h.focus.focus_gained();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_focus_never_refetches() {
    let h = harness(NetworkInfo::offline());
    let calls = Arc::new(AtomicU32::new(0));
    assert!(h.client.network_status().is_offline);
    assert_eq!(h.client.network_status().cache_ttl_multiplier, 10);

    h.client.set_cached("okr:offline", &"cached".to_string(), true).unwrap();
    let _query: Query<String> = h.client.get(
      "okr:offline",
      counting(&calls, "fresh"),
      QueryOptions::default(),
    );
    settle().await;

    for _ in 0..6 {
      tokio::time::advance(Duration::from_secs(10)).await;
      h.focus.focus_gained();
      settle().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_focus_disabled_per_query() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));
    let _query: Query<String> = h.client.get(
      "okr:quiet",
      counting(&calls, "x"),
      QueryOptions::default().with_revalidate_on_focus(false),
    );
    settle().await;

    h.focus.focus_gained();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_refetches_mounted_consumers() {
    let h = harness(connection("4g"));
    let calls = Arc::new(AtomicU32::new(0));

    let mounted: Query<String> =
      h.client
        .get("okr:acme:q1", counting(&calls, "x"), QueryOptions::default());
    h.client.set_cached("okr:acme:q2", &"y".to_string(), true).unwrap();
    h.client.set_cached("okr:other:q1", &"z".to_string(), true).unwrap();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let removed = h.client.invalidate("okr:acme:");
    assert_eq!(removed, 2);
    assert_eq!(h.client.get_cached::<String>("okr:acme:q2"), None);
    assert_eq!(h.client.get_cached::<String>("okr:other:q1"), Some("z".to_string()));

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(mounted.data(), Some("x".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_failure_is_swallowed() {
    let h = harness(connection("4g"));
    h.client
      .prefetch("okr:broken", || async { Err::<String, _>(eyre!("boom")) })
      .await;

    assert_eq!(h.client.get_cached::<String>("okr:broken"), None);
    let query: Query<String> = h.client.get(
      "okr:broken",
      || async { Ok("ok".to_string()) },
      QueryOptions::default(),
    );
    assert_eq!(query.error(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscriber_handles_are_independent() {
    let h = harness(connection("4g"));
    let hits = Arc::new(AtomicU32::new(0));

    let counter = hits.clone();
    let a = h.client.subscribe("k", move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = hits.clone();
    let b = h.client.subscribe("k", move || {
      counter.fetch_add(10, Ordering::SeqCst);
    });
    assert_ne!(a, b);

    h.client.set_cached("k", &1u32, false).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 11);

    assert!(h.client.unsubscribe("k", a));
    assert!(!h.client.unsubscribe("k", a));
    h.client.set_cached("k", &2u32, false).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 21);
  }
}
