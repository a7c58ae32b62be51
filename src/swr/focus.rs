//! Foreground focus events and the global focus-revalidation throttle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

/// The host regained foreground focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusEvent {
  /// Increases by one per focus change, so consumers can tell events apart
  pub seq: u64,
}

/// Source of focus events.
pub trait FocusSignal: Send + Sync {
  fn subscribe(&self) -> broadcast::Receiver<FocusEvent>;
}

/// Broadcasts focus events to every subscribed consumer.
#[derive(Clone)]
pub struct FocusEvents {
  tx: broadcast::Sender<FocusEvent>,
  seq: Arc<AtomicU64>,
}

impl FocusEvents {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(16);
    Self {
      tx,
      seq: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Report that the host regained focus.
  pub fn focus_gained(&self) {
    let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
    // No subscribers is fine
    let _ = self.tx.send(FocusEvent { seq });
  }
}

impl Default for FocusEvents {
  fn default() -> Self {
    Self::new()
  }
}

impl FocusSignal for FocusEvents {
  fn subscribe(&self) -> broadcast::Receiver<FocusEvent> {
    self.tx.subscribe()
  }
}

/// Client-wide throttle for focus-triggered revalidation.
///
/// The decision for a given event is remembered, so every consumer handling
/// the same focus event gets the same answer.
#[derive(Debug, Default)]
pub(crate) struct FocusGate {
  last_revalidate_ms: Option<i64>,
  decision: Option<(u64, bool)>,
}

impl FocusGate {
  pub(crate) fn admit(
    &mut self,
    event: FocusEvent,
    now_ms: i64,
    throttle: Option<Duration>,
  ) -> bool {
    if let Some((seq, allowed)) = self.decision {
      if seq == event.seq {
        return allowed;
      }
    }

    let allowed = match (throttle, self.last_revalidate_ms) {
      (None, _) => false,
      (Some(_), None) => true,
      (Some(throttle), Some(last)) => now_ms - last > throttle.as_millis() as i64,
    };

    if allowed {
      self.last_revalidate_ms = Some(now_ms);
    }
    self.decision = Some((event.seq, allowed));
    allowed
  }
}
