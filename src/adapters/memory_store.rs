//! In-process record store, used when no database is configured

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::domain::MarketRecord;
use crate::error::Result;
use crate::strategy::RecordSink;

/// Records keyed by market id, merged with the same rules as the database
pub struct MemoryStore {
    records: DashMap<String, MarketRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, market_id: &str) -> Option<MarketRecord> {
        self.records.get(market_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn within(&self, window: Duration) -> Vec<MarketRecord> {
        let cutoff = self.clock.now() - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::zero());
        let mut records: Vec<MarketRecord> = self
            .records
            .iter()
            .filter(|r| r.logged_at.map_or(false, |t| t >= cutoff))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.logged_at.cmp(&a.logged_at));
        records
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn upsert(&self, record: &MarketRecord) -> Result<()> {
        let now = self.clock.now();
        self.records
            .entry(record.market_id.clone())
            .and_modify(|existing| existing.merge(record.clone()))
            .or_insert_with(|| {
                let mut fresh = record.clone();
                fresh.logged_at = Some(now);
                fresh
            });
        Ok(())
    }

    async fn recent_ids(&self, window: Duration) -> Result<HashSet<String>> {
        Ok(self.within(window).into_iter().map(|r| r.market_id).collect())
    }

    async fn recent_records(&self, window: Duration) -> Result<Vec<MarketRecord>> {
        Ok(self.within(window))
    }
}
