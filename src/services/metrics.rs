use crate::domain::{Decision, MarketRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Process-wide counters
#[derive(Debug)]
pub struct Metrics {
    /// Text frames received from the price stream
    pub messages_received: AtomicU64,
    /// Frames that produced a price update
    pub price_updates: AtomicU64,
    /// Frames that were not JSON or carried no usable price
    pub messages_dropped: AtomicU64,
    /// Price stream reconnections
    pub ws_reconnections: AtomicU64,
    /// Markets handed to the supervisor and accepted
    pub markets_launched: AtomicU64,
    /// Launches rejected because the market was already running
    pub duplicate_launches: AtomicU64,
    pub markets_skipped: AtomicU64,
    pub markets_traded: AtomicU64,
    pub simulated_wins: AtomicU64,
    pub simulated_losses: AtomicU64,
    /// Market tasks that ended in an error, panic or cancellation
    pub controller_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            price_updates: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            ws_reconnections: AtomicU64::new(0),
            markets_launched: AtomicU64::new(0),
            duplicate_launches: AtomicU64::new(0),
            markets_skipped: AtomicU64::new(0),
            markets_traded: AtomicU64::new(0),
            simulated_wins: AtomicU64::new(0),
            simulated_losses: AtomicU64::new(0),
            controller_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_price_updates(&self) {
        self.price_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnections(&self) {
        self.ws_reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_launched(&self) {
        self.markets_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates(&self) {
        self.duplicate_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failures(&self) {
        self.controller_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a terminal record by decision and outcome
    pub fn record_terminal(&self, record: &MarketRecord) {
        match record.decision {
            Decision::Skip => {
                self.markets_skipped.fetch_add(1, Ordering::Relaxed);
            }
            Decision::Active => {
                self.markets_traded.fetch_add(1, Ordering::Relaxed);
                match record.would_have_won {
                    Some(true) => {
                        self.simulated_wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(false) => {
                        self.simulated_losses.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {}
                }
            }
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "msgs={} prices={} dropped={} reconnects={} | launched={} dup={} skipped={} traded={} W/L={}/{} failures={}",
            self.messages_received.load(Ordering::Relaxed),
            self.price_updates.load(Ordering::Relaxed),
            self.messages_dropped.load(Ordering::Relaxed),
            self.ws_reconnections.load(Ordering::Relaxed),
            self.markets_launched.load(Ordering::Relaxed),
            self.duplicate_launches.load(Ordering::Relaxed),
            self.markets_skipped.load(Ordering::Relaxed),
            self.markets_traded.load(Ordering::Relaxed),
            self.simulated_wins.load(Ordering::Relaxed),
            self.simulated_losses.load(Ordering::Relaxed),
            self.controller_failures.load(Ordering::Relaxed),
        )
    }

    /// Export metrics in Prometheus format. Gauges are passed in by the caller.
    pub fn prometheus(&self, active_markets: usize, price_available: bool) -> String {
        format!(
            r#"# HELP polywatch_stream_messages_total Text frames received from the price stream
# TYPE polywatch_stream_messages_total counter
polywatch_stream_messages_total {}

# HELP polywatch_price_updates_total Accepted price updates
# TYPE polywatch_price_updates_total counter
polywatch_price_updates_total {}

# HELP polywatch_stream_dropped_total Frames dropped as malformed or unusable
# TYPE polywatch_stream_dropped_total counter
polywatch_stream_dropped_total {}

# HELP polywatch_ws_reconnections_total Price stream reconnections
# TYPE polywatch_ws_reconnections_total counter
polywatch_ws_reconnections_total {}

# HELP polywatch_markets_launched_total Markets accepted by the supervisor
# TYPE polywatch_markets_launched_total counter
polywatch_markets_launched_total {}

# HELP polywatch_duplicate_launches_total Launches rejected as duplicates
# TYPE polywatch_duplicate_launches_total counter
polywatch_duplicate_launches_total {}

# HELP polywatch_markets_skipped_total Markets logged as SKIP
# TYPE polywatch_markets_skipped_total counter
polywatch_markets_skipped_total {}

# HELP polywatch_markets_traded_total Markets logged as ACTIVE
# TYPE polywatch_markets_traded_total counter
polywatch_markets_traded_total {}

# HELP polywatch_simulated_wins_total Simulated trades that won
# TYPE polywatch_simulated_wins_total counter
polywatch_simulated_wins_total {}

# HELP polywatch_simulated_losses_total Simulated trades that lost
# TYPE polywatch_simulated_losses_total counter
polywatch_simulated_losses_total {}

# HELP polywatch_controller_failures_total Market tasks ending in error, panic or cancellation
# TYPE polywatch_controller_failures_total counter
polywatch_controller_failures_total {}

# HELP polywatch_active_markets Markets currently running
# TYPE polywatch_active_markets gauge
polywatch_active_markets {}

# HELP polywatch_price_available Whether a fresh reference price is available
# TYPE polywatch_price_available gauge
polywatch_price_available {}
"#,
            self.messages_received.load(Ordering::Relaxed),
            self.price_updates.load(Ordering::Relaxed),
            self.messages_dropped.load(Ordering::Relaxed),
            self.ws_reconnections.load(Ordering::Relaxed),
            self.markets_launched.load(Ordering::Relaxed),
            self.duplicate_launches.load(Ordering::Relaxed),
            self.markets_skipped.load(Ordering::Relaxed),
            self.markets_traded.load(Ordering::Relaxed),
            self.simulated_wins.load(Ordering::Relaxed),
            self.simulated_losses.load(Ordering::Relaxed),
            self.controller_failures.load(Ordering::Relaxed),
            active_markets,
            u8::from(price_available),
        )
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!("Status: {}", self.summary());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
