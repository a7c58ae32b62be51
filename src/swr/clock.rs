use chrono::Utc;
use tokio::time::Instant;

/// Wall-clock milliseconds that advance with tokio's clock.
///
/// Anchored to the system time once, then driven by [`tokio::time::Instant`],
/// so a paused test runtime controls every freshness decision.
#[derive(Debug, Clone)]
pub struct Clock {
  epoch_ms: i64,
  started: Instant,
}

impl Clock {
  pub fn new() -> Self {
    Self::starting_at(Utc::now().timestamp_millis())
  }

  pub fn starting_at(epoch_ms: i64) -> Self {
    Self {
      epoch_ms,
      started: Instant::now(),
    }
  }

  pub fn now_ms(&self) -> i64 {
    self.epoch_ms + self.started.elapsed().as_millis() as i64
  }
}

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}
