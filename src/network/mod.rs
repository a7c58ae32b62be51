//! Network quality classification and the policy knobs derived from it.
//!
//! The monitor never talks to the network itself: connectivity information is
//! pushed in through a [`NetworkSignal`]. When no connection metadata is
//! available the quality defaults to [`Quality::Medium`].

pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Coarse connection quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
  Fast,
  Medium,
  Slow,
  Offline,
}

impl std::fmt::Display for Quality {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Quality::Fast => "fast",
      Quality::Medium => "medium",
      Quality::Slow => "slow",
      Quality::Offline => "offline",
    };
    f.write_str(s)
  }
}

/// Image quality hint for consumers that load media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
  Low,
  Medium,
  High,
}

/// Connection metadata, when the host can provide it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
  /// Effective connection type (`slow-2g`, `2g`, `3g`, `4g`)
  pub effective_type: Option<String>,
  pub downlink_mbps: Option<f64>,
  pub rtt_ms: Option<u64>,
  pub save_data: bool,
}

/// Raw connectivity signals as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
  pub online: bool,
  pub connection: Option<ConnectionInfo>,
}

impl NetworkInfo {
  /// Online with no connection metadata.
  pub fn unknown() -> Self {
    Self {
      online: true,
      connection: None,
    }
  }

  pub fn offline() -> Self {
    Self {
      online: false,
      connection: None,
    }
  }

  pub fn with_connection(connection: ConnectionInfo) -> Self {
    Self {
      online: true,
      connection: Some(connection),
    }
  }
}

/// Source of connectivity information.
///
/// `watch` doubles as the pull (`borrow`) and push (`changed`) interface.
pub trait NetworkSignal: Send + Sync {
  fn watch(&self) -> watch::Receiver<NetworkInfo>;
}

/// A network signal whose value is set by the host.
pub struct ManualNetworkSignal {
  tx: watch::Sender<NetworkInfo>,
}

impl ManualNetworkSignal {
  pub fn new(initial: NetworkInfo) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  /// Signal with no connection metadata, which classifies as medium.
  pub fn unknown() -> Self {
    Self::new(NetworkInfo::unknown())
  }

  /// Publish new connectivity information. Subscribers are only woken on change.
  pub fn set(&self, info: NetworkInfo) {
    self.tx.send_if_modified(|current| {
      if *current == info {
        false
      } else {
        *current = info;
        true
      }
    });
  }
}

impl NetworkSignal for ManualNetworkSignal {
  fn watch(&self) -> watch::Receiver<NetworkInfo> {
    self.tx.subscribe()
  }
}

/// Classify connectivity signals into a quality tier. First match wins.
pub fn assess(info: &NetworkInfo) -> Quality {
  if !info.online {
    return Quality::Offline;
  }

  let Some(conn) = &info.connection else {
    return Quality::Medium;
  };

  let effective_type = conn.effective_type.as_deref();
  let rtt = conn.rtt_ms;
  let downlink = conn.downlink_mbps;

  if matches!(effective_type, Some("slow-2g") | Some("2g"))
    || rtt.is_some_and(|r| r > 1000)
    || downlink.is_some_and(|d| d < 0.5)
  {
    return Quality::Slow;
  }

  if effective_type == Some("3g")
    || rtt.is_some_and(|r| r > 400)
    || downlink.is_some_and(|d| d < 2.0)
  {
    return Quality::Medium;
  }

  Quality::Fast
}

/// Cache and refetch policy for a quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkPolicy {
  /// Multiplier applied to a caller's base TTL
  pub ttl_multiplier: u32,
  pub suggested_image_quality: ImageQuality,
  /// Minimum time between focus-triggered revalidations; `None` disables them
  pub focus_throttle: Option<Duration>,
}

pub fn policy(quality: Quality) -> NetworkPolicy {
  match quality {
    Quality::Fast => NetworkPolicy {
      ttl_multiplier: 1,
      suggested_image_quality: ImageQuality::High,
      focus_throttle: Some(Duration::from_secs(30)),
    },
    Quality::Medium => NetworkPolicy {
      ttl_multiplier: 2,
      suggested_image_quality: ImageQuality::Medium,
      focus_throttle: Some(Duration::from_secs(60)),
    },
    Quality::Slow => NetworkPolicy {
      ttl_multiplier: 5,
      suggested_image_quality: ImageQuality::Low,
      focus_throttle: Some(Duration::from_secs(120)),
    },
    Quality::Offline => NetworkPolicy {
      ttl_multiplier: 10,
      suggested_image_quality: ImageQuality::Low,
      focus_throttle: None,
    },
  }
}

/// Derived network status handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkStatus {
  pub quality: Quality,
  pub is_offline: bool,
  pub is_slow: bool,
  pub effective_type: String,
  pub downlink_mbps: Option<f64>,
  pub rtt_ms: Option<u64>,
  pub save_data: bool,
  pub suggested_image_quality: ImageQuality,
  pub cache_ttl_multiplier: u32,
}

impl NetworkStatus {
  pub fn from_info(info: &NetworkInfo) -> Self {
    let quality = assess(info);
    let policy = policy(quality);
    let conn = info.connection.as_ref();
    let save_data = conn.is_some_and(|c| c.save_data);

    Self {
      quality,
      is_offline: quality == Quality::Offline,
      is_slow: quality == Quality::Slow,
      effective_type: conn
        .and_then(|c| c.effective_type.clone())
        .unwrap_or_else(|| "unknown".to_string()),
      downlink_mbps: conn.and_then(|c| c.downlink_mbps),
      rtt_ms: conn.and_then(|c| c.rtt_ms),
      save_data,
      suggested_image_quality: if save_data {
        ImageQuality::Low
      } else {
        policy.suggested_image_quality
      },
      cache_ttl_multiplier: policy.ttl_multiplier,
    }
  }

  pub fn policy(&self) -> NetworkPolicy {
    policy(self.quality)
  }
}

/// Tracks the host's network signal and exposes the derived status.
#[derive(Clone)]
pub struct NetworkMonitor {
  signal: Arc<dyn NetworkSignal>,
}

impl NetworkMonitor {
  pub fn new(signal: Arc<dyn NetworkSignal>) -> Self {
    Self { signal }
  }

  /// One-shot status for non-reactive call sites.
  pub fn status(&self) -> NetworkStatus {
    let rx = self.signal.watch();
    let info = rx.borrow();
    NetworkStatus::from_info(&info)
  }

  pub fn quality(&self) -> Quality {
    self.status().quality
  }

  /// Push-based status updates.
  pub fn subscribe(&self) -> NetworkWatcher {
    NetworkWatcher {
      rx: self.signal.watch(),
    }
  }
}

/// Receives a fresh [`NetworkStatus`] on every connectivity change.
pub struct NetworkWatcher {
  rx: watch::Receiver<NetworkInfo>,
}

impl NetworkWatcher {
  /// Wait for the next change. Returns `None` once the signal is gone.
  pub async fn changed(&mut self) -> Option<NetworkStatus> {
    self.rx.changed().await.ok()?;
    let status = NetworkStatus::from_info(&self.rx.borrow_and_update());
    debug!(quality = %status.quality, "Network status changed");
    Some(status)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn conn(effective_type: &str, rtt_ms: u64, downlink_mbps: f64) -> NetworkInfo {
    NetworkInfo::with_connection(ConnectionInfo {
      effective_type: Some(effective_type.to_string()),
      downlink_mbps: Some(downlink_mbps),
      rtt_ms: Some(rtt_ms),
      save_data: false,
    })
  }

  #[test]
  fn test_offline_wins_over_metadata() {
    let mut info = conn("4g", 20, 50.0);
    info.online = false;
    assert_eq!(assess(&info), Quality::Offline);
  }

  #[test]
  fn test_missing_metadata_defaults_to_medium() {
    assert_eq!(assess(&NetworkInfo::unknown()), Quality::Medium);
  }

  #[test]
  fn test_slow_classification() {
    assert_eq!(assess(&conn("2g", 100, 10.0)), Quality::Slow);
    assert_eq!(assess(&conn("slow-2g", 100, 10.0)), Quality::Slow);
    assert_eq!(assess(&conn("4g", 1001, 10.0)), Quality::Slow);
    assert_eq!(assess(&conn("4g", 50, 0.4)), Quality::Slow);
  }

  #[test]
  fn test_medium_classification() {
    assert_eq!(assess(&conn("3g", 100, 10.0)), Quality::Medium);
    assert_eq!(assess(&conn("4g", 401, 10.0)), Quality::Medium);
    assert_eq!(assess(&conn("4g", 50, 1.5)), Quality::Medium);
  }

  #[test]
  fn test_fast_classification() {
    assert_eq!(assess(&conn("4g", 400, 2.0)), Quality::Fast);
  }

  #[test]
  fn test_partial_metadata() {
    let info = NetworkInfo::with_connection(ConnectionInfo {
      effective_type: None,
      downlink_mbps: None,
      rtt_ms: Some(1500),
      save_data: false,
    });
    assert_eq!(assess(&info), Quality::Slow);
  }

  #[test]
  fn test_policy_table() {
    assert_eq!(policy(Quality::Fast).ttl_multiplier, 1);
    assert_eq!(policy(Quality::Medium).ttl_multiplier, 2);
    assert_eq!(policy(Quality::Slow).ttl_multiplier, 5);
    assert_eq!(policy(Quality::Offline).ttl_multiplier, 10);
    assert_eq!(
      policy(Quality::Slow).focus_throttle,
      Some(Duration::from_secs(120))
    );
    assert_eq!(policy(Quality::Offline).focus_throttle, None);
  }

  #[test]
  fn test_save_data_forces_low_images() {
    let mut info = conn("4g", 20, 50.0);
    if let Some(c) = info.connection.as_mut() {
      c.save_data = true;
    }
    let status = NetworkStatus::from_info(&info);
    assert_eq!(status.quality, Quality::Fast);
    assert_eq!(status.suggested_image_quality, ImageQuality::Low);
  }

  #[test]
  fn test_offline_status_flags() {
    let status = NetworkStatus::from_info(&NetworkInfo::offline());
    assert!(status.is_offline);
    assert!(!status.is_slow);
    assert_eq!(status.cache_ttl_multiplier, 10);
    assert_eq!(status.effective_type, "unknown");
  }

  #[tokio::test]
  async fn test_watcher_receives_changes() {
    let signal = Arc::new(ManualNetworkSignal::unknown());
    let monitor = NetworkMonitor::new(signal.clone());
    let mut watcher = monitor.subscribe();

    assert_eq!(monitor.quality(), Quality::Medium);

    signal.set(NetworkInfo::offline());
    let status = watcher.changed().await.expect("signal alive");
    assert_eq!(status.quality, Quality::Offline);
    assert_eq!(monitor.quality(), Quality::Offline);
  }
}
