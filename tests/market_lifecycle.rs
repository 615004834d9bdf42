//! End-to-end market lifecycle scenarios under paused tokio time

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use polywatch::adapters::MemoryStore;
use polywatch::clock::{Clock, TokioClock};
use polywatch::domain::{Decision, MarketDescriptor, MarketPhase, MarketRecord, Side, SkipReason};
use polywatch::error::{PolywatchError, Result};
use polywatch::services::Metrics;
use polywatch::strategy::{
    capture_beat_price, LifecycleConfig, MarketContext, MarketController, MarketSupervisor,
    OutcomeLookup, PriceSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const BEAT: f64 = 100_000.0;

fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 24, 12, 0, 0).unwrap()
}

fn tracking_start() -> DateTime<Utc> {
    window_start() + ChronoDuration::seconds(14 * 60 + 30)
}

fn market(id: &str) -> MarketDescriptor {
    let start = window_start();
    MarketDescriptor::new(id, format!("btc-updown-15m-{id}"), start, start + ChronoDuration::minutes(15))
}

/// Price as a function of the wall clock
struct ScriptedPrices {
    clock: Arc<TokioClock>,
    script: Box<dyn Fn(DateTime<Utc>) -> Option<f64> + Send + Sync>,
}

impl PriceSource for ScriptedPrices {
    fn price(&self) -> Option<f64> {
        (self.script)(self.clock.now())
    }
}

/// Resolves after a number of polls, or never
struct ScriptedOutcome {
    resolve_on_poll: Option<usize>,
    side: Side,
    polls: AtomicUsize,
}

impl ScriptedOutcome {
    fn new(resolve_on_poll: Option<usize>, side: Side) -> Self {
        Self {
            resolve_on_poll,
            side,
            polls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OutcomeLookup for ScriptedOutcome {
    async fn fetch_outcome(&self, _market_id: &str) -> Result<Option<Side>> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.resolve_on_poll {
            Some(n) if poll >= n => Ok(Some(self.side)),
            Some(_) if poll == 1 => Err(PolywatchError::Internal("gamma unavailable".into())),
            _ => Ok(None),
        }
    }
}

struct Harness {
    clock: Arc<TokioClock>,
    sink: Arc<MemoryStore>,
    outcomes: Arc<ScriptedOutcome>,
    ctx: MarketContext,
}

fn harness(
    script: impl Fn(DateTime<Utc>) -> Option<f64> + Send + Sync + 'static,
    outcomes: ScriptedOutcome,
) -> Harness {
    let clock = Arc::new(TokioClock::starting_at(window_start() - ChronoDuration::seconds(30)));
    let sink = Arc::new(MemoryStore::with_clock(clock.clone()));
    let outcomes = Arc::new(outcomes);
    let prices = Arc::new(ScriptedPrices {
        clock: clock.clone(),
        script: Box::new(script),
    });
    let ctx = MarketContext {
        prices,
        outcomes: outcomes.clone(),
        sink: sink.clone(),
        clock: clock.clone(),
    };
    Harness {
        clock,
        sink,
        outcomes,
        ctx,
    }
}

/// Beat capture followed by the controller, as the supervisor runs them
async fn run_lifecycle(h: &Harness, id: &str) -> (MarketRecord, MarketPhase) {
    let mut m = market(id);
    capture_beat_price(&mut m, h.ctx.prices.as_ref(), h.ctx.clock.as_ref())
        .await
        .unwrap();

    let (phase_tx, phase_rx) = watch::channel(MarketPhase::BeatCapture);
    let record = MarketController::new(m, LifecycleConfig::default(), h.ctx.clone(), phase_tx)
        .run()
        .await
        .unwrap();
    let phase = *phase_rx.borrow();
    (record, phase)
}

fn secs_since(t: DateTime<Utc>, anchor: DateTime<Utc>) -> f64 {
    (t - anchor).num_milliseconds() as f64 / 1000.0
}

#[tokio::test(start_paused = true)]
async fn drift_up_then_settles_as_win() {
    // 100100 at tracking start, rising linearly to 100200 on the last tick
    let h = harness(
        |now| {
            if now < tracking_start() {
                return Some(BEAT);
            }
            let elapsed = secs_since(now, tracking_start());
            Some((100_100.0 + elapsed * 100.0 / 29.0).min(100_200.0))
        },
        ScriptedOutcome::new(Some(2), Side::Up),
    );

    let (record, phase) = run_lifecycle(&h, "win").await;

    assert_eq!(phase, MarketPhase::Log);
    assert_eq!(record.decision, Decision::Active);
    assert_eq!(record.beat_price, Some(BEAT));
    assert_eq!(record.price_before_beat, Some(BEAT));
    assert_eq!(record.price_after_beat, Some(BEAT));
    assert_eq!(record.would_buy, Some(Side::Up));
    assert_eq!(record.price_at_t14_59, Some(100_200.0));
    assert_eq!(record.distance_at_decision, Some(200.0));
    assert_eq!(record.actual_outcome, Some(Side::Up));
    assert_eq!(record.would_have_won, Some(true));
    assert_eq!(record.theoretical_pnl, Some(100.0));
    assert_eq!(record.simulated_shares, Some(10_000));
    assert_eq!(record.buy_price, Some(0.99));

    let samples = record.price_samples.as_ref().unwrap();
    assert_eq!(samples.len(), 29);
    assert_eq!(samples[0].tick, 0);
    assert_eq!(samples[28].tick, 28);
    // Tick k lands exactly on tracking_start + k + 1
    for (k, s) in samples.iter().enumerate() {
        assert_eq!(s.timestamp, tracking_start() + ChronoDuration::seconds(k as i64 + 1));
    }

    // Settlement polls are anchored at the last tick (close - 1s). The first
    // poll errors, the second resolves.
    assert_eq!(h.outcomes.polls.load(Ordering::SeqCst), 2);
    assert_eq!(h.clock.now(), window_start() + ChronoDuration::seconds(15 * 60 + 29));

    let stored = h.sink.get("win").unwrap();
    assert_eq!(stored.theoretical_pnl, Some(100.0));
    assert!(stored.logged_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn price_gone_at_evaluation_skips_with_zero_distance() {
    let h = harness(
        |now| (now < tracking_start()).then_some(BEAT),
        ScriptedOutcome::new(Some(1), Side::Up),
    );

    let (record, _) = run_lifecycle(&h, "gone").await;

    assert_eq!(record.decision, Decision::Skip);
    assert_eq!(record.skip_reason, Some(SkipReason::ChainlinkUnavailable));
    assert_eq!(record.distance_at_decision, Some(0.0));
    assert_eq!(record.current_price, None);
    assert_eq!(record.price_samples, None);
    assert_eq!(h.outcomes.polls.load(Ordering::SeqCst), 0);
    assert_eq!(h.clock.now(), tracking_start());
}

#[tokio::test(start_paused = true)]
async fn unresolved_settlement_leaves_outcome_unknown() {
    let h = harness(
        |now| Some(if now < tracking_start() { BEAT } else { BEAT - 60.0 }),
        ScriptedOutcome::new(None, Side::Up),
    );

    let (record, _) = run_lifecycle(&h, "open").await;

    assert_eq!(record.decision, Decision::Active);
    assert_eq!(record.would_buy, Some(Side::Down));
    assert_eq!(record.actual_outcome, None);
    assert_eq!(record.would_have_won, None);
    assert_eq!(record.theoretical_pnl, None);
    assert_eq!(h.outcomes.polls.load(Ordering::SeqCst), 20);
    assert_eq!(h.clock.now(), window_start() + ChronoDuration::seconds(20 * 60 - 1));
}

#[tokio::test(start_paused = true)]
async fn distance_collapse_mid_tracking_aborts() {
    // Distance 100 until tick 10, which reads 100010
    let h = harness(
        |now| {
            if now < tracking_start() {
                Some(BEAT)
            } else if now < tracking_start() + ChronoDuration::seconds(11) {
                Some(100_100.0)
            } else {
                Some(100_010.0)
            }
        },
        ScriptedOutcome::new(Some(1), Side::Up),
    );

    let (record, _) = run_lifecycle(&h, "unstable").await;

    assert_eq!(record.decision, Decision::Skip);
    assert_eq!(record.skip_reason, Some(SkipReason::UnstableDuringTracking));
    assert_eq!(record.distance_at_decision, Some(10.0));
    assert_eq!(record.current_price, Some(100_010.0));

    let samples = record.price_samples.unwrap();
    assert_eq!(samples.len(), 11);
    assert_eq!(samples.last().unwrap().tick, 10);

    // Nothing scheduled after the aborting tick
    assert_eq!(h.clock.now(), tracking_start() + ChronoDuration::seconds(11));
    assert_eq!(h.outcomes.polls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn distance_gates_at_evaluation() {
    for (price, reason) in [
        (BEAT + 10.0, Some(SkipReason::DistanceTooSmall)),
        (BEAT - 130.0, Some(SkipReason::DistanceTooLarge)),
        (BEAT + 125.0, None),
    ] {
        let h = harness(
            move |now| Some(if now < tracking_start() { BEAT } else { price }),
            ScriptedOutcome::new(Some(1), Side::Up),
        );
        let (record, _) = run_lifecycle(&h, "gate").await;
        assert_eq!(record.skip_reason, reason, "price {price}");
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_notifications_run_one_task() {
    let h = harness(
        |now| Some(if now < tracking_start() { BEAT } else { BEAT + 50.0 }),
        ScriptedOutcome::new(Some(1), Side::Up),
    );
    let metrics = Arc::new(Metrics::new());
    let supervisor = MarketSupervisor::new(h.ctx.clone(), LifecycleConfig::default(), metrics.clone());

    assert!(supervisor.launch(market("dup")));
    for _ in 0..5 {
        assert!(!supervisor.launch(market("dup")));
    }
    assert_eq!(supervisor.active_ids(), vec!["dup".to_string()]);

    // Still rejected while the beat is being captured
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(supervisor.active()[0].phase, MarketPhase::BeatCapture);
    assert!(!supervisor.launch(market("dup")));

    tokio::time::sleep(Duration::from_secs(20 * 60)).await;
    assert!(supervisor.is_empty());
    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.sink.get("dup").unwrap().would_have_won, Some(true));
    assert_eq!(metrics.duplicate_launches.load(Ordering::Relaxed), 6);
    assert_eq!(metrics.markets_traded.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.simulated_wins.load(Ordering::Relaxed), 1);
}
