//! Background revalidation triggers for one mounted query.
//!
//! Each mounted [`Query`](super::Query) owns one task running [`run`]. The
//! task wakes on the refresh interval, on focus regain, on network changes
//! and on updates to its key, and is aborted when the query is dropped.

use std::future::pending;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use super::client::{ErasedFetcher, SwrClient};
use super::focus::FocusEvent;
use super::options::QueryOptions;
use crate::network::{NetworkStatus, NetworkWatcher};

struct Triggers {
  interval: Option<Interval>,
  focus: Option<broadcast::Receiver<FocusEvent>>,
  network: Option<NetworkWatcher>,
  updates: watch::Receiver<u64>,
}

/// Spawn the trigger loop for `key`.
///
/// Subscriptions are taken before returning, so events sent right after
/// mounting are not missed.
pub(crate) fn spawn(
  client: SwrClient,
  key: String,
  fetcher: ErasedFetcher,
  options: QueryOptions,
  updates: watch::Receiver<u64>,
) -> JoinHandle<()> {
  let interval = refresh_interval(options.refresh_interval);
  let focus = options
    .revalidate_on_focus
    .then(|| client.focus_signal().subscribe());
  let triggers = Triggers {
    interval,
    focus,
    network: Some(client.network().subscribe()),
    updates,
  };

  tokio::spawn(run(client, key, fetcher, options, triggers))
}

fn refresh_interval(period: Duration) -> Option<Interval> {
  if period.is_zero() {
    return None;
  }
  let mut interval = interval_at(Instant::now() + period, period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  Some(interval)
}

async fn run(
  client: SwrClient,
  key: String,
  fetcher: ErasedFetcher,
  options: QueryOptions,
  mut triggers: Triggers,
) {
  loop {
    tokio::select! {
      _ = tick(&mut triggers.interval) => {
        debug!(key = %key, "Refresh interval elapsed");
        let _ = client.spawn_revalidate(&key, fetcher.clone(), &options);
      }
      event = recv_focus(&mut triggers.focus) => {
        match event {
          Ok(event) => {
            if client.admit_focus(event) {
              debug!(key = %key, seq = event.seq, "Revalidating on focus");
              let _ = client.spawn_revalidate(&key, fetcher.clone(), &options);
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(key = %key, skipped, "Missed focus events");
          }
          Err(broadcast::error::RecvError::Closed) => triggers.focus = None,
        }
      }
      status = network_changed(&mut triggers.network) => {
        match status {
          Some(_) => {
            if client.is_stale(&key, options.ttl).unwrap_or(false) {
              debug!(key = %key, "Network changed, revalidating stale entry");
              let _ = client.spawn_revalidate(&key, fetcher.clone(), &options);
            }
          }
          None => triggers.network = None,
        }
      }
      changed = triggers.updates.changed() => {
        if changed.is_err() {
          break;
        }
        if client.needs_refetch(&key) {
          debug!(key = %key, "Entry removed, refetching");
          let _ = client.spawn_revalidate(&key, fetcher.clone(), &options);
        }
      }
    }
  }
}

async fn tick(interval: &mut Option<Interval>) {
  match interval {
    Some(interval) => {
      interval.tick().await;
    }
    None => pending().await,
  }
}

async fn recv_focus(
  focus: &mut Option<broadcast::Receiver<FocusEvent>>,
) -> Result<FocusEvent, broadcast::error::RecvError> {
  match focus {
    Some(rx) => rx.recv().await,
    None => pending().await,
  }
}

async fn network_changed(network: &mut Option<NetworkWatcher>) -> Option<NetworkStatus> {
  match network {
    Some(watcher) => watcher.changed().await,
    None => pending().await,
  }
}
