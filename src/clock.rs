//! Wall-clock access and deadline-based sleeping.
//!
//! Every phase of a market is anchored to absolute wall-clock instants
//! (window start, tracking start, tick `k`). Sleeping is always expressed as
//! "until this instant" so scheduling drift never accumulates across ticks.

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock driven by the tokio timer.
///
/// Reports `anchor + elapsed tokio time`, so under a paused runtime
/// (`start_paused = true`) it advances exactly as far as the timer is
/// auto-advanced by pending sleeps.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor_wall + elapsed
    }
}

/// Suspend until `deadline` on the given clock. Returns immediately if the
/// deadline has already passed.
pub async fn sleep_until(clock: &dyn Clock, deadline: DateTime<Utc>) {
    if let Ok(remaining) = (deadline - clock.now()).to_std() {
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Unix time in fractional seconds
pub fn unix_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}
