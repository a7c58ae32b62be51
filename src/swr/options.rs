use std::time::Duration;

/// Per-key fetching options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  /// Suppress all fetching and scheduling for this consumer
  pub skip: bool,
  /// Base freshness window, before the network-quality multiplier
  pub ttl: Duration,
  /// Mirror entries into the durable tier
  pub persist: bool,
  /// Retries after the first failed attempt
  pub retries: u32,
  /// Unconditional revalidation cadence; zero disables it
  pub refresh_interval: Duration,
  pub revalidate_on_focus: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      skip: false,
      ttl: Duration::from_secs(5 * 60),
      persist: true,
      retries: 2,
      refresh_interval: Duration::ZERO,
      revalidate_on_focus: true,
    }
  }
}

impl QueryOptions {
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
    self.refresh_interval = interval;
    self
  }

  pub fn with_persist(mut self, persist: bool) -> Self {
    self.persist = persist;
    self
  }

  pub fn with_skip(mut self, skip: bool) -> Self {
    self.skip = skip;
    self
  }

  pub fn with_revalidate_on_focus(mut self, enabled: bool) -> Self {
    self.revalidate_on_focus = enabled;
    self
  }
}
