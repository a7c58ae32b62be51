//! Cursor-paginated lists on top of the SWR cache.
//!
//! The first page is an ordinary cached key. Later pages are fetched on demand
//! with [`PaginatedQuery::load_more`] and appended to an in-memory list that is
//! thrown away whenever the first page is replaced.

use std::future::Future;
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::error::FetchError;
use crate::swr::{Query, QueryOptions, SwrClient};
use crate::sync::lock;

/// One page of a cursor-paginated endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPage<T> {
  /// Pointer to the next page, either a URL carrying a `cursor` parameter or a bare cursor
  pub next: Option<String>,
  pub previous: Option<String>,
  pub results: Vec<T>,
}

/// Cursor to request after a page whose `next` pointer is `next`.
pub fn extract_cursor(next: &str) -> String {
  let parsed = Url::parse(next).or_else(|_| {
    Url::parse("http://relative.invalid/").and_then(|base| base.join(next))
  });

  parsed
    .ok()
    .and_then(|url| {
      url
        .query_pairs()
        .find(|(name, _)| name == "cursor")
        .map(|(_, value)| value.into_owned())
    })
    .unwrap_or_else(|| next.to_string())
}

type PageFetcher<T> =
  Arc<dyn Fn(Option<String>) -> BoxFuture<'static, Result<CursorPage<T>>> + Send + Sync>;

struct PageState<T> {
  /// Results from pages after the first, in load order
  extra: Vec<T>,
  next_cursor: Option<String>,
  loading_more: bool,
  /// First-page revision the accumulator was built against; `None` until the
  /// first sync, so a page served straight from cache still yields its cursor
  synced_revision: Option<u64>,
  /// Bumped on every reset; loads started in an older epoch are discarded
  epoch: u64,
  error: Option<FetchError>,
}

impl<T> Default for PageState<T> {
  fn default() -> Self {
    Self {
      extra: Vec::new(),
      next_cursor: None,
      loading_more: false,
      synced_revision: None,
      epoch: 0,
      error: None,
    }
  }
}

impl<T> PageState<T> {
  fn reset(&mut self, next_cursor: Option<String>) {
    self.extra.clear();
    self.next_cursor = next_cursor;
    self.loading_more = false;
    self.epoch += 1;
    self.error = None;
  }
}

/// A mounted consumer of a cursor-paginated list.
pub struct PaginatedQuery<T> {
  first: Query<CursorPage<T>>,
  fetch_page: PageFetcher<T>,
  pages: Arc<Mutex<PageState<T>>>,
  appended: Arc<watch::Sender<u64>>,
  appended_rx: watch::Receiver<u64>,
}

impl<T> PaginatedQuery<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
  pub(crate) fn mount<F, Fut>(
    client: &SwrClient,
    key: String,
    fetch_page: F,
    options: QueryOptions,
  ) -> Self
  where
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CursorPage<T>>> + Send + 'static,
  {
    let fetch_page: PageFetcher<T> = Arc::new(move |cursor| fetch_page(cursor).boxed());

    let first_page = fetch_page.clone();
    let first = client.get(key, move || first_page(None), options);
    let (appended, appended_rx) = watch::channel(0u64);

    Self {
      first,
      fetch_page,
      pages: Arc::new(Mutex::new(PageState::default())),
      appended: Arc::new(appended),
      appended_rx,
    }
  }

  /// Handle for the cached first page.
  pub fn first(&self) -> &Query<CursorPage<T>> {
    &self.first
  }

  /// First-page results followed by every loaded page.
  pub fn data(&self) -> Vec<T> {
    let first = self.first.data();
    let pages = self.sync();
    let mut data = first.map(|page| page.results).unwrap_or_default();
    data.extend(pages.extra.iter().cloned());
    data
  }

  pub fn total_loaded(&self) -> usize {
    self.data().len()
  }

  pub fn has_more(&self) -> bool {
    self.sync().next_cursor.is_some()
  }

  pub fn loading_more(&self) -> bool {
    self.sync().loading_more
  }

  /// Failure of the last page load, or of the first page.
  pub fn error(&self) -> Option<FetchError> {
    let page_error = self.sync().error.clone();
    page_error.or_else(|| self.first.error())
  }

  /// Fetch the page after the last loaded one and append it.
  ///
  /// Does nothing when there is no next page or a load is already running.
  pub async fn load_more(&self) -> Result<(), FetchError> {
    let (cursor, epoch) = {
      let mut pages = self.sync();
      if pages.loading_more {
        debug!("Page load already in flight");
        return Ok(());
      }
      let Some(cursor) = pages.next_cursor.clone() else {
        return Ok(());
      };
      pages.loading_more = true;
      (cursor, pages.epoch)
    };

    let fetch_page = self.fetch_page.clone();
    let pages = self.pages.clone();
    let appended = self.appended.clone();
    let task = tokio::spawn(async move {
      let result = fetch_page(Some(cursor.clone())).await;
      let outcome = apply_page(&pages, epoch, &cursor, result);
      appended.send_modify(|version| *version = version.wrapping_add(1));
      outcome
    });

    task
      .await
      .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())))
  }

  /// Drop loaded pages and revalidate the first page.
  ///
  /// If the revalidation fails the cursor is rebuilt from the cached first
  /// page, so loading more keeps working.
  pub async fn refresh(&self) -> Result<(), FetchError> {
    {
      let mut pages = lock(&self.pages);
      pages.reset(None);
      pages.synced_revision = None;
    }
    self.first.revalidate().await
  }

  /// Wait until the first page or the loaded pages change.
  pub async fn changed(&mut self) -> bool {
    tokio::select! {
      changed = self.first.changed() => changed,
      changed = self.appended_rx.changed() => changed.is_ok(),
    }
  }

  /// Lock page state, resetting it first if the first page was replaced.
  fn sync(&self) -> std::sync::MutexGuard<'_, PageState<T>> {
    let revision = self.first.revision();
    let mut pages = lock(&self.pages);
    if pages.synced_revision != Some(revision) {
      let next = self
        .first
        .data()
        .and_then(|page| page.next)
        .map(|next| extract_cursor(&next));
      debug!(revision, "First page replaced, resetting loaded pages");
      pages.reset(next);
      pages.synced_revision = Some(revision);
    }
    pages
  }
}

fn apply_page<T>(
  pages: &Mutex<PageState<T>>,
  epoch: u64,
  cursor: &str,
  result: Result<CursorPage<T>>,
) -> Result<(), FetchError> {
  let mut pages = lock(pages);
  if pages.epoch != epoch {
    debug!(cursor, "Discarding page loaded before a reset");
    return Ok(());
  }
  pages.loading_more = false;

  match result {
    Ok(page) => {
      debug!(cursor, count = page.results.len(), "Loaded page");
      pages.extra.extend(page.results);
      pages.next_cursor = page.next.map(|next| extract_cursor(&next));
      pages.error = None;
      Ok(())
    }
    Err(e) => {
      let error = FetchError::failed(1, &e);
      pages.error = Some(error.clone());
      Err(error)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{KeyValueStore, MemoryKvStore};
  use crate::network::{ConnectionInfo, ManualNetworkSignal, NetworkInfo};
  use crate::swr::Clock;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use std::time::Duration;

  fn client() -> SwrClient {
    client_over(Arc::new(MemoryKvStore::new()))
  }

  fn client_over(durable: Arc<dyn KeyValueStore>) -> SwrClient {
    let network = ManualNetworkSignal::new(NetworkInfo::with_connection(ConnectionInfo {
      effective_type: Some("4g".to_string()),
      downlink_mbps: None,
      rtt_ms: None,
      save_data: false,
    }));
    SwrClient::builder()
      .durable(durable)
      .network(Arc::new(network))
      .clock(Clock::starting_at(1_700_000_000_000))
      .build()
  }

  fn page(results: &[&str], next: Option<&str>) -> CursorPage<String> {
    CursorPage {
      next: next.map(str::to_string),
      previous: None,
      results: results.iter().map(|s| s.to_string()).collect(),
    }
  }

  async fn settle() {
    for _ in 0..20 {
      tokio::task::yield_now().await;
    }
  }

  #[test]
  fn test_extract_cursor_from_url() {
    assert_eq!(
      extract_cursor("https://api.example.com/okrs?cursor=cD0yMDI0&page_size=20"),
      "cD0yMDI0"
    );
    assert_eq!(extract_cursor("/api/tasks/?cursor=abc%3D"), "abc=");
  }

  #[test]
  fn test_extract_cursor_falls_back_to_raw() {
    assert_eq!(extract_cursor("c1"), "c1");
    assert_eq!(
      extract_cursor("https://api.example.com/okrs?page=2"),
      "https://api.example.com/okrs?page=2"
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_load_more_appends_in_order() {
    let client = client();
    let query = client.get_paginated(
      "tasks:list",
      |cursor: Option<String>| async move {
        match cursor.as_deref() {
          None => Ok(page(&["a", "b"], Some("c1"))),
          Some("c1") => Ok(page(&["c", "d"], None)),
          Some(other) => Err(eyre!("unexpected cursor {}", other)),
        }
      },
      QueryOptions::default(),
    );
    settle().await;

    assert_eq!(query.data(), vec!["a", "b"]);
    assert!(query.has_more());

    query.load_more().await.unwrap();
    assert_eq!(query.data(), vec!["a", "b", "c", "d"]);
    assert_eq!(query.total_loaded(), 4);
    assert!(!query.has_more());
    assert!(!query.loading_more());

    // Nothing further to load
    query.load_more().await.unwrap();
    assert_eq!(query.total_loaded(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_page_change_resets_accumulator() {
    let client = client();
    let query = client.get_paginated(
      "tasks:list",
      |cursor: Option<String>| async move {
        match cursor {
          None => Ok(page(&["a", "b"], Some("https://x.test/tasks?cursor=c1"))),
          Some(_) => Ok(page(&["c"], None)),
        }
      },
      QueryOptions::default(),
    );
    settle().await;
    query.load_more().await.unwrap();
    assert_eq!(query.data(), vec!["a", "b", "c"]);

    client
      .set_cached("tasks:list", &page(&["z"], Some("c9")), false)
      .unwrap();
    assert_eq!(query.data(), vec!["z"]);
    assert!(query.has_more());
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_load_more_fetches_once() {
    let client = client();
    let page_calls = Arc::new(AtomicU32::new(0));
    let calls = page_calls.clone();
    let query = client.get_paginated(
      "tasks:list",
      move |cursor: Option<String>| {
        let calls = calls.clone();
        async move {
          if cursor.is_none() {
            return Ok(page(&["a"], Some("c1")));
          }
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(page(&["b"], None))
        }
      },
      QueryOptions::default(),
    );
    settle().await;

    let (first, second) = tokio::join!(query.load_more(), query.load_more());
    assert!(first.is_ok() && second.is_ok());
    assert_eq!(page_calls.load(Ordering::SeqCst), 1);
    assert_eq!(query.data(), vec!["a", "b"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_load_across_refresh_is_discarded() {
    let client = client();
    let query = client.get_paginated(
      "tasks:list",
      |cursor: Option<String>| async move {
        match cursor {
          None => Ok(page(&["a"], Some("c1"))),
          Some(_) => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(page(&["late"], None))
          }
        }
      },
      QueryOptions::default(),
    );
    settle().await;

    let (loaded, refreshed) = tokio::join!(query.load_more(), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      query.refresh().await
    });
    assert!(loaded.is_ok() && refreshed.is_ok());
    assert_eq!(query.data(), vec!["a"]);
    assert!(query.has_more());
  }

  #[tokio::test(start_paused = true)]
  async fn test_page_failure_is_reported() {
    let client = client();
    let query = client.get_paginated(
      "tasks:list",
      |cursor: Option<String>| async move {
        match cursor {
          None => Ok(page(&["a"], Some("c1"))),
          Some(_) => Err(eyre!("503 Service Unavailable")),
        }
      },
      QueryOptions::default(),
    );
    settle().await;

    let err = query.load_more().await.unwrap_err();
    assert!(matches!(err, FetchError::Failed { attempts: 1, .. }));
    assert_eq!(query.error(), Some(err));
    // The cursor is kept so the load can be retried
    assert!(query.has_more());
    assert_eq!(query.data(), vec!["a"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_page_from_durable_tier_keeps_cursor() {
    let durable = Arc::new(MemoryKvStore::new());
    client_over(durable.clone())
      .set_cached("tasks:list", &page(&["a", "b"], Some("c1")), true)
      .unwrap();

    let first_page_calls = Arc::new(AtomicU32::new(0));
    let calls = first_page_calls.clone();
    let reloaded = client_over(durable);
    let query = reloaded.get_paginated(
      "tasks:list",
      move |cursor: Option<String>| {
        let calls = calls.clone();
        async move {
          match cursor.as_deref() {
            None => {
              calls.fetch_add(1, Ordering::SeqCst);
              Ok(page(&["a", "b"], Some("c1")))
            }
            Some("c1") => Ok(page(&["c", "d"], None)),
            Some(other) => Err(eyre!("unexpected cursor {}", other)),
          }
        }
      },
      QueryOptions::default().with_ttl(Duration::from_secs(600)),
    );
    settle().await;

    // Served straight from disk, still fresh
    assert_eq!(first_page_calls.load(Ordering::SeqCst), 0);
    assert_eq!(query.data(), vec!["a", "b"]);
    assert!(query.has_more());

    query.load_more().await.unwrap();
    assert_eq!(query.data(), vec!["a", "b", "c", "d"]);
    assert!(!query.has_more());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refresh_keeps_cursor() {
    let client = client();
    let offline = Arc::new(AtomicBool::new(false));
    let flag = offline.clone();
    let query = client.get_paginated(
      "tasks:list",
      move |cursor: Option<String>| {
        let offline = flag.load(Ordering::SeqCst);
        async move {
          if offline {
            return Err(eyre!("offline"));
          }
          match cursor {
            None => Ok(page(&["a"], Some("c1"))),
            Some(_) => Ok(page(&["b"], None)),
          }
        }
      },
      QueryOptions::default().with_retries(0),
    );
    settle().await;
    assert!(query.has_more());

    offline.store(true, Ordering::SeqCst);
    let err = query.refresh().await.unwrap_err();
    assert!(matches!(err, FetchError::Failed { attempts: 1, .. }));
    assert_eq!(query.data(), vec!["a"]);
    assert!(query.has_more());

    offline.store(false, Ordering::SeqCst);
    query.load_more().await.unwrap();
    assert_eq!(query.data(), vec!["a", "b"]);
  }
}
