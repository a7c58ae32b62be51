//! Active network probe for hosts without a platform connectivity API.
//!
//! Periodically issues a HEAD request against a known endpoint, measures the
//! round trip and publishes the result into a [`ManualNetworkSignal`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ConnectionInfo, ManualNetworkSignal, NetworkInfo};

/// Probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
  pub url: String,
  pub interval: Duration,
  pub timeout: Duration,
  pub save_data: bool,
}

/// Map a measured round trip to an effective connection type.
pub fn effective_type_for_rtt(rtt: Duration) -> &'static str {
  match rtt.as_millis() {
    r if r >= 2000 => "slow-2g",
    r if r >= 1400 => "2g",
    r if r >= 270 => "3g",
    _ => "4g",
  }
}

/// Probe once and return the observed connectivity.
///
/// Any HTTP response counts as online; transport errors count as offline.
pub async fn probe_once(http: &reqwest::Client, config: &ProbeConfig) -> NetworkInfo {
  let started = Instant::now();
  match http
    .head(&config.url)
    .timeout(config.timeout)
    .send()
    .await
  {
    Ok(response) => {
      let rtt = started.elapsed();
      debug!(
        url = %config.url,
        status = %response.status(),
        rtt_ms = rtt.as_millis() as u64,
        "Network probe succeeded"
      );
      NetworkInfo::with_connection(ConnectionInfo {
        effective_type: Some(effective_type_for_rtt(rtt).to_string()),
        downlink_mbps: None,
        rtt_ms: Some(rtt.as_millis() as u64),
        save_data: config.save_data,
      })
    }
    Err(e) => {
      warn!(url = %config.url, "Network probe failed: {}", e);
      NetworkInfo::offline()
    }
  }
}

/// Spawn a background task that keeps `signal` up to date.
pub fn spawn_probe(
  http: reqwest::Client,
  config: ProbeConfig,
  signal: Arc<ManualNetworkSignal>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let info = probe_once(&http, &config).await;
      signal.set(info);
    }
  })
}
