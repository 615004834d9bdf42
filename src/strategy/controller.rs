//! Market lifecycle controller
//!
//! One controller runs per market once its beat price is known:
//!
//! ```text
//! IDLE -> EVALUATE -> ACTIVE (one tick per second) -> DECISION -> SETTLEMENT_WAIT -> LOG
//!            |              |
//!            +-> SKIP       +-> SKIP
//! ```
//!
//! Every wake-up is an absolute deadline derived from the tracking start, so
//! a slow tick never shifts the ticks after it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::traits::{OutcomeLookup, PriceSource, RecordSink};
use crate::clock::{sleep_until, Clock};
use crate::config::{SettlementConfig, StrategyConfig};
use crate::domain::{
    round2, Decision, MarketDescriptor, MarketPhase, MarketRecord, Side, SkipReason,
    TrackingSample,
};
use crate::error::{PolywatchError, Result};

/// Collaborators shared by every market task
#[derive(Clone)]
pub struct MarketContext {
    pub prices: Arc<dyn PriceSource>,
    pub outcomes: Arc<dyn OutcomeLookup>,
    pub sink: Arc<dyn RecordSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleConfig {
    pub strategy: StrategyConfig,
    pub settlement: SettlementConfig,
}

/// Terminal SKIP raised by a phase
#[derive(Debug, Clone, PartialEq)]
struct Skip {
    reason: SkipReason,
    distance: f64,
    current_price: Option<f64>,
    samples: Vec<TrackingSample>,
}

impl Skip {
    fn new(reason: SkipReason, distance: f64, current_price: Option<f64>) -> Self {
        Self {
            reason,
            distance,
            current_price,
            samples: Vec::new(),
        }
    }
}

/// Distance gate applied at evaluation
pub fn gate_distance(distance: f64, config: &StrategyConfig) -> Option<SkipReason> {
    if distance > config.distance_max {
        Some(SkipReason::DistanceTooLarge)
    } else if distance < config.distance_min {
        Some(SkipReason::DistanceTooSmall)
    } else {
        None
    }
}

/// Win flag and theoretical P&L of a simulated buy of `side`.
/// Both are `None` while the outcome is unknown.
pub fn settle(
    side: Side,
    outcome: Option<Side>,
    buy_price: f64,
    shares: i64,
) -> (Option<bool>, Option<f64>) {
    let won = outcome.map(|o| o == side);
    let pnl = won.map(|won| {
        let shares = shares as f64;
        let pnl = if won {
            (1.0 - buy_price) * shares
        } else {
            -buy_price * shares
        };
        round2(pnl)
    });
    (won, pnl)
}

pub struct MarketController {
    market: MarketDescriptor,
    config: LifecycleConfig,
    ctx: MarketContext,
    phase: watch::Sender<MarketPhase>,
}

impl MarketController {
    pub fn new(
        market: MarketDescriptor,
        config: LifecycleConfig,
        ctx: MarketContext,
        phase: watch::Sender<MarketPhase>,
    ) -> Self {
        Self {
            market,
            config,
            ctx,
            phase,
        }
    }

    fn enter(&self, phase: MarketPhase) {
        self.phase.send_replace(phase);
    }

    fn tracking_start(&self) -> DateTime<Utc> {
        self.market
            .tracking_start(Duration::from_secs(self.config.strategy.tracking_start_secs))
    }

    /// Drive the market to its terminal record and write it to the sink
    pub async fn run(self) -> Result<MarketRecord> {
        let beat = self.market.beat_price.ok_or_else(|| {
            PolywatchError::InvalidMarketData(format!(
                "market {} has no beat price",
                self.market.id
            ))
        })?;
        let slug = &self.market.slug;
        let tracking_start = self.tracking_start();

        info!(
            "[{}] Monitoring. Beat: ${:.2} | Ends: {}",
            slug,
            beat,
            self.market.end_time.to_rfc3339()
        );

        self.enter(MarketPhase::Idle);
        sleep_until(self.ctx.clock.as_ref(), tracking_start).await;

        self.enter(MarketPhase::Evaluate);
        let distance = match self.evaluate(beat) {
            Ok(distance) => distance,
            Err(skip) => return self.log_skip(skip).await,
        };

        info!(
            "[{}] ACTIVE - distance ${:.2}, tracking for {}s",
            slug, distance, self.config.strategy.tracking_ticks
        );

        self.enter(MarketPhase::Active);
        let samples = match self.track(beat, tracking_start, distance).await {
            Ok(samples) => samples,
            Err(skip) => return self.log_skip(skip).await,
        };

        self.enter(MarketPhase::Decision);
        let Some(last) = samples.last() else {
            return Err(PolywatchError::Internal(format!(
                "[{}] tracking finished without samples",
                slug
            )));
        };
        let side = last.side;
        info!(
            "[{}] DECISION - Would buy {} at ${} | BTC: ${:.2} | Dist: ${:.2}",
            slug, side, self.config.strategy.buy_price, last.price, last.distance
        );

        self.enter(MarketPhase::SettlementWait);
        let outcome = self.await_outcome().await;

        self.enter(MarketPhase::Log);
        let record = self.active_record(samples, outcome);
        self.ctx.sink.upsert(&record).await?;
        log_summary(&record);
        Ok(record)
    }

    /// Price and distance at tracking start, or the SKIP it leads to
    fn evaluate(&self, beat: f64) -> std::result::Result<f64, Skip> {
        let Some(price) = self.ctx.prices.price() else {
            return Err(Skip::new(SkipReason::ChainlinkUnavailable, 0.0, None));
        };

        let distance = (price - beat).abs();
        match gate_distance(distance, &self.config.strategy) {
            Some(reason) => Err(Skip::new(reason, distance, Some(price))),
            None => Ok(distance),
        }
    }

    /// Sample once per second until close. Tick `k` wakes at
    /// `tracking_start + k + 1` seconds.
    async fn track(
        &self,
        beat: f64,
        tracking_start: DateTime<Utc>,
        mut distance: f64,
    ) -> std::result::Result<Vec<TrackingSample>, Skip> {
        let ticks = self.config.strategy.tracking_ticks;
        let mut samples = Vec::with_capacity(ticks);

        for tick in 0..ticks {
            let deadline = tracking_start + ChronoDuration::seconds(tick as i64 + 1);
            sleep_until(self.ctx.clock.as_ref(), deadline).await;

            let Some(price) = self.ctx.prices.price() else {
                return Err(Skip {
                    samples,
                    ..Skip::new(SkipReason::ChainlinkLostDuringTracking, distance, None)
                });
            };

            distance = (price - beat).abs();
            samples.push(TrackingSample {
                tick,
                timestamp: self.ctx.clock.now(),
                price,
                distance: round2(distance),
                side: Side::from_prices(price, beat),
            });

            if distance < self.config.strategy.distance_min {
                return Err(Skip {
                    samples,
                    ..Skip::new(SkipReason::UnstableDuringTracking, distance, Some(price))
                });
            }
        }

        Ok(samples)
    }

    /// Poll the outcome lookup until it resolves or the timeout elapses.
    /// Lookup errors count as "not resolved yet".
    async fn await_outcome(&self) -> Option<Side> {
        let interval = self.config.settlement.poll_interval();
        let timeout = self.config.settlement.poll_timeout();
        let anchor = self.ctx.clock.now();
        let mut elapsed = Duration::ZERO;

        while elapsed < timeout {
            elapsed += interval;
            let deadline = anchor + ChronoDuration::from_std(elapsed).unwrap_or_else(|_| ChronoDuration::zero());
            sleep_until(self.ctx.clock.as_ref(), deadline).await;

            match self.ctx.outcomes.fetch_outcome(&self.market.id).await {
                Ok(Some(outcome)) => return Some(outcome),
                Ok(None) => {}
                Err(e) => warn!("Error polling outcome for {}: {}", self.market.id, e),
            }
        }

        warn!("Timeout waiting for outcome: {}", self.market.id);
        None
    }

    fn active_record(&self, samples: Vec<TrackingSample>, outcome: Option<Side>) -> MarketRecord {
        let strategy = &self.config.strategy;
        let price_at = |i: usize| samples.get(i).map(|s| s.price);
        let last = samples.last();
        let side = last.map(|s| s.side);
        let (won, pnl) = match side {
            Some(side) => settle(side, outcome, strategy.buy_price, strategy.simulated_shares),
            None => (None, None),
        };

        MarketRecord {
            price_at_t14_31: price_at(0),
            price_at_t14_45: price_at(14),
            price_at_t14_55: price_at(24),
            price_at_t14_58: price_at(27),
            price_at_t14_59: last.map(|s| s.price),
            current_price: last.map(|s| s.price),
            distance_at_t14_31: samples.first().map(|s| s.distance),
            distance_at_decision: last.map(|s| s.distance),
            would_buy: side,
            actual_outcome: outcome,
            would_have_won: won,
            theoretical_pnl: pnl,
            simulated_shares: Some(strategy.simulated_shares),
            buy_price: Some(strategy.buy_price),
            price_samples: Some(samples.clone()),
            ..MarketRecord::for_market(&self.market, Decision::Active)
        }
    }

    async fn log_skip(&self, skip: Skip) -> Result<MarketRecord> {
        self.enter(MarketPhase::Log);
        let mut record = MarketRecord::skipped(&self.market, skip.reason);
        record.distance_at_decision = Some(round2(skip.distance));
        record.current_price = skip.current_price;
        if !skip.samples.is_empty() {
            record.price_samples = Some(skip.samples);
        }

        self.ctx.sink.upsert(&record).await?;
        log_summary(&record);
        Ok(record)
    }
}

/// One line per terminal record
pub fn summary_line(record: &MarketRecord) -> String {
    let slug = record.market_slug.as_deref().unwrap_or("unknown");
    let beat = record
        .beat_price
        .map(|b| format!("${:.2}", b))
        .unwrap_or_else(|| "-".to_string());
    let dist = record
        .distance_at_decision
        .map(|d| format!("${:.2}", d))
        .unwrap_or_else(|| "-".to_string());

    match record.decision {
        Decision::Skip => format!(
            "{} | Beat: {} | Dist: {} | SKIP ({})",
            slug,
            beat,
            dist,
            record.skip_reason.map(|r| r.as_str()).unwrap_or("unknown")
        ),
        Decision::Active => {
            let result = match record.would_have_won {
                Some(true) => "WIN",
                Some(false) => "LOSS",
                None => "UNKNOWN",
            };
            format!(
                "{} | Beat: {} | Dist: {} | ACTIVE | {} | Outcome: {} | {}",
                slug,
                beat,
                dist,
                record.would_buy.map(|s| s.as_str()).unwrap_or("-"),
                record.actual_outcome.map(|s| s.as_str()).unwrap_or("-"),
                result
            )
        }
    }
}

fn log_summary(record: &MarketRecord) {
    info!("{}", summary_line(record));
}
