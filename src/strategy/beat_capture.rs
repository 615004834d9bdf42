//! Beat-price capture at the start of a market window.

use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use super::traits::PriceSource;
use crate::clock::{sleep_until, Clock};
use crate::domain::{MarketDescriptor, SkipReason};

/// Fill in the beat price of `market`.
///
/// For a window that has not started yet, three samples are taken at
/// `start - 1s`, `start` (the beat price) and `start + 1s`. A window that is
/// already running gets the current price as its beat price. On failure the
/// market must be logged as SKIP with the returned reason.
pub async fn capture_beat_price(
    market: &mut MarketDescriptor,
    prices: &dyn PriceSource,
    clock: &dyn Clock,
) -> Result<f64, SkipReason> {
    if let Some(beat) = market.beat_price {
        return Ok(beat);
    }

    let Some(current) = prices.price() else {
        warn!("[{}] No Chainlink price available. Logging as SKIP.", market.slug);
        return Err(SkipReason::ChainlinkUnavailableAtOpen);
    };

    if market.has_started(clock.now()) {
        // Single sample, so less precise than the bracketed capture below
        market.beat_price = Some(current);
        warn!(
            "[{}] Market already started. Using current price ${:.2} as approximate beat_price",
            market.slug, current
        );
        return Ok(current);
    }

    let one_second = ChronoDuration::seconds(1);
    let start = market.start_time;

    sleep_until(clock, start - one_second).await;
    market.price_before_beat = prices.price();

    sleep_until(clock, start).await;
    market.beat_price = prices.price();

    sleep_until(clock, start + one_second).await;
    market.price_after_beat = prices.price();

    match (market.price_before_beat, market.beat_price, market.price_after_beat) {
        (Some(before), Some(beat), Some(after)) => {
            info!(
                "[{}] Beat: ${:.2} (T-1: ${:.2}, T+1: ${:.2})",
                market.slug, beat, before, after
            );
            Ok(beat)
        }
        _ => {
            warn!(
                "[{}] Price feed died during beat capture. Logging as SKIP.",
                market.slug
            );
            Err(SkipReason::ChainlinkLostDuringBeatCapture)
        }
    }
}
