//! Stale-while-revalidate queries over the persistent cache.
//!
//! [`SwrClient`] is the shared engine; [`Query`] is the per-consumer handle
//! returned by [`SwrClient::get`].

mod client;
mod clock;
mod focus;
mod options;
mod query;
mod scheduler;

pub use client::{SubscriptionId, SwrClient, SwrClientBuilder};
pub use clock::Clock;
pub use focus::{FocusEvent, FocusEvents, FocusSignal};
pub use options::QueryOptions;
pub use query::{Query, QueryState};
