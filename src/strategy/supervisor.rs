//! Market task supervisor
//!
//! Owns the set of running markets. A market id is registered before its
//! beat capture starts and removed when its task ends for any reason, so at
//! most one task ever runs per id.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::beat_capture::capture_beat_price;
use super::controller::{LifecycleConfig, MarketContext, MarketController};
use crate::domain::{MarketDescriptor, MarketPhase, MarketRecord};
use crate::error::Result;
use crate::services::metrics::Metrics;

struct ActiveMarket {
    slug: String,
    launched_at: DateTime<Utc>,
    phase: watch::Receiver<MarketPhase>,
    abort: Option<AbortHandle>,
}

/// Read-only view of a running market
#[derive(Debug, Clone, Serialize)]
pub struct ActiveMarketInfo {
    pub market_id: String,
    pub slug: String,
    pub phase: MarketPhase,
    pub launched_at: DateTime<Utc>,
}

pub struct MarketSupervisor {
    active: Arc<DashMap<String, ActiveMarket>>,
    ctx: MarketContext,
    config: LifecycleConfig,
    metrics: Arc<Metrics>,
}

impl MarketSupervisor {
    pub fn new(ctx: MarketContext, config: LifecycleConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            ctx,
            config,
            metrics,
        }
    }

    /// Start the lifecycle of `market`. Returns `false` if a task for the
    /// same id is already running.
    pub fn launch(&self, market: MarketDescriptor) -> bool {
        let market_id = market.id.clone();
        let (phase_tx, phase_rx) = watch::channel(MarketPhase::BeatCapture);

        match self.active.entry(market_id.clone()) {
            Entry::Occupied(_) => {
                debug!("[{}] Already running, ignoring duplicate", market.slug);
                self.metrics.inc_duplicates();
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveMarket {
                    slug: market.slug.clone(),
                    launched_at: self.ctx.clock.now(),
                    phase: phase_rx,
                    abort: None,
                });
            }
        }
        self.metrics.inc_launched();

        let slug = market.slug.clone();
        let task = tokio::spawn(run_market(
            market,
            self.ctx.clone(),
            self.config.clone(),
            phase_tx,
        ));

        if let Some(mut entry) = self.active.get_mut(&market_id) {
            entry.abort = Some(task.abort_handle());
        }

        let active = self.active.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            active.remove(&market_id);

            match outcome {
                Ok(Ok(record)) => metrics.record_terminal(&record),
                Ok(Err(e)) => {
                    metrics.inc_failures();
                    error!("[{}] Strategy error: {}", slug, e);
                }
                Err(e) if e.is_cancelled() => {
                    metrics.inc_failures();
                    info!("[{}] Market task cancelled", slug);
                }
                Err(e) => {
                    metrics.inc_failures();
                    error!("[{}] Market task panicked: {}", slug, e);
                }
            }
        });

        true
    }

    pub fn is_active(&self, market_id: &str) -> bool {
        self.active.contains_key(market_id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub fn active(&self) -> Vec<ActiveMarketInfo> {
        let mut markets: Vec<ActiveMarketInfo> = self
            .active
            .iter()
            .map(|e| ActiveMarketInfo {
                market_id: e.key().clone(),
                slug: e.slug.clone(),
                phase: *e.phase.borrow(),
                launched_at: e.launched_at,
            })
            .collect();
        markets.sort_by(|a, b| a.launched_at.cmp(&b.launched_at));
        markets
    }

    /// Abort every running market. Aborted markets write no record.
    pub fn shutdown(&self) {
        let mut aborted = 0;
        for entry in self.active.iter() {
            if let Some(handle) = &entry.abort {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!("Aborted {} running market(s)", aborted);
        }
    }
}

/// Beat capture followed by the controller proper. A failed capture is
/// logged as SKIP without starting a controller.
async fn run_market(
    mut market: MarketDescriptor,
    ctx: MarketContext,
    config: LifecycleConfig,
    phase: watch::Sender<MarketPhase>,
) -> Result<MarketRecord> {
    if let Err(reason) =
        capture_beat_price(&mut market, ctx.prices.as_ref(), ctx.clock.as_ref()).await
    {
        phase.send_replace(MarketPhase::Log);
        let record = MarketRecord::skipped(&market, reason);
        ctx.sink.upsert(&record).await?;
        info!("{}", super::controller::summary_line(&record));
        return Ok(record);
    }

    MarketController::new(market, config, ctx, phase).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::clock::TokioClock;
    use crate::domain::{Decision, Side, SkipReason};
    use crate::strategy::traits::{MockOutcomeLookup, PriceSource};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;

    struct FixedPrice(Option<f64>);

    impl PriceSource for FixedPrice {
        fn price(&self) -> Option<f64> {
            self.0
        }
    }

    fn window_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 24, 12, 0, 0).unwrap()
    }

    fn supervisor(price: Option<f64>, sink: Arc<MemoryStore>) -> MarketSupervisor {
        let mut outcomes = MockOutcomeLookup::new();
        outcomes
            .expect_fetch_outcome()
            .returning(|_| Ok(Some(Side::Up)));

        let ctx = MarketContext {
            prices: Arc::new(FixedPrice(price)),
            outcomes: Arc::new(outcomes),
            sink,
            clock: Arc::new(TokioClock::starting_at(window_start() - ChronoDuration::seconds(30))),
        };
        MarketSupervisor::new(ctx, LifecycleConfig::default(), Arc::new(Metrics::new()))
    }

    fn market(id: &str) -> MarketDescriptor {
        let start = window_start();
        MarketDescriptor::new(id, format!("slug-{id}"), start, start + ChronoDuration::minutes(15))
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_launch_is_rejected() {
        let sink = Arc::new(MemoryStore::new());
        let sup = supervisor(Some(100_050.0), sink.clone());

        assert!(sup.launch(market("1")));
        assert!(!sup.launch(market("1")));
        assert!(sup.launch(market("2")));
        assert_eq!(sup.len(), 2);

        tokio::task::yield_now().await;
        let phases: Vec<_> = sup.active().into_iter().map(|m| m.phase).collect();
        assert!(phases.iter().all(|p| *p == MarketPhase::BeatCapture));
        assert_eq!(sup.metrics.duplicate_launches.load(std::sync::atomic::Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        // A flat price sits on the beat price, so both markets end as SKIP
        assert!(sup.is_empty());
        let record = sink.get("1").unwrap();
        assert_eq!(record.decision, Decision::Skip);
        assert_eq!(record.skip_reason, Some(SkipReason::DistanceTooSmall));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_logs_skip_without_controller() {
        let sink = Arc::new(MemoryStore::new());
        let sup = supervisor(None, sink.clone());

        assert!(sup.launch(market("1")));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!sup.is_active("1"));
        let record = sink.get("1").unwrap();
        assert_eq!(record.skip_reason, Some(SkipReason::ChainlinkUnavailableAtOpen));
        assert_eq!(record.end_time, Some(window_start() + ChronoDuration::minutes(15)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_without_record() {
        let sink = Arc::new(MemoryStore::new());
        let sup = supervisor(Some(100_050.0), sink.clone());

        assert!(sup.launch(market("1")));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sup.active()[0].phase, MarketPhase::Idle);

        sup.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(sup.is_empty());
        assert!(sink.is_empty());
        assert_eq!(sup.metrics.controller_failures.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_after_completion() {
        let sink = Arc::new(MemoryStore::new());
        let sup = supervisor(None, sink.clone());

        assert!(sup.launch(market("1")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sup.launch(market("1")));
    }
}
