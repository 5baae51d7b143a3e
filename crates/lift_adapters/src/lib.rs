//! Lift-status adapters.
//!
//! Every resort is served by one variant of a closed set of adapters behind
//! the [`LiftStatusAdapter`] trait, so callers never special-case a resort.

pub mod fixture;
pub mod json_feed;
pub mod registry;

use async_trait::async_trait;
use common::{LiftStatusSnapshot, Result};
use tokio::time::Instant;

pub use fixture::FixtureAdapter;
pub use json_feed::JsonFeedAdapter;
pub use registry::{AdapterKind, AdapterRegistry};

/// Capability to fetch one resort's current lift status.
#[async_trait]
pub trait LiftStatusAdapter: Send + Sync {
    /// Fetch a snapshot, giving up by `deadline`.
    ///
    /// Callers also enforce the deadline; implementations use it to bound
    /// their own I/O.
    async fn fetch(&self, deadline: Instant) -> Result<LiftStatusSnapshot>;

    /// Upstream location, for failure events.
    fn source_url(&self) -> &str;
}
