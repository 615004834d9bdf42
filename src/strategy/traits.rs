//! Seams between the market lifecycle and its collaborators.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

use crate::domain::{MarketRecord, Side};
use crate::error::Result;

/// Read access to the reference price
pub trait PriceSource: Send + Sync {
    /// Fresh price, `None` when unavailable or stale
    fn price(&self) -> Option<f64>;
}

/// Settlement lookup for a market
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutcomeLookup: Send + Sync {
    /// `Ok(None)` while the market is unresolved
    async fn fetch_outcome(&self, market_id: &str) -> Result<Option<Side>>;
}

/// Durable store of terminal records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert or merge a record keyed by market id. Absent fields never
    /// overwrite stored ones.
    async fn upsert(&self, record: &MarketRecord) -> Result<()>;

    /// Ids of markets logged within `window`
    async fn recent_ids(&self, window: Duration) -> Result<HashSet<String>>;

    /// Records logged within `window`, newest first
    async fn recent_records(&self, window: Duration) -> Result<Vec<MarketRecord>>;
}
