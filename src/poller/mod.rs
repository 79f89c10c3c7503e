//! Upstream health source
//!
//! [`HealthSource`] is the poll-lane boundary: the scheduler asks it for a snapshot once
//! per interval and turns the snapshot into ticks.

pub mod http;
pub mod snapshot;

pub use http::HttpHealthSource;
pub use snapshot::{parse_status_document, HealthSnapshot, ModelReading};

use async_trait::async_trait;

/// Provides health snapshots
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Fetch the current snapshot.
    ///
    /// Returns `Ok(None)` when the upstream document is unchanged since the last
    /// successful fetch.
    async fn fetch_if_changed(&self) -> Result<Option<HealthSnapshot>, FetchError>;

    /// Forget the last document so the next fetch reports it as changed
    fn forget_last(&self) {}
}

/// Transient upstream failure. The cycle produces no ticks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream returned HTTP {0}")]
    Status(u16),

    #[error("Malformed status document: {0}")]
    Parse(String),
}
