use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::market::{Decision, MarketDescriptor, Side, SkipReason, TrackingSample};

/// Terminal record of one market, the unit of persistence.
///
/// Records are upserted by `market_id`. An upsert never erases a stored
/// value with an absent one, see [`MarketRecord::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub market_id: String,
    pub market_slug: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub beat_price: Option<f64>,
    pub price_before_beat: Option<f64>,
    pub price_after_beat: Option<f64>,
    pub decision: Decision,
    pub skip_reason: Option<SkipReason>,
    pub price_at_t14_31: Option<f64>,
    pub price_at_t14_45: Option<f64>,
    pub price_at_t14_55: Option<f64>,
    pub price_at_t14_58: Option<f64>,
    pub price_at_t14_59: Option<f64>,
    /// Last observed price when the record was written
    pub current_price: Option<f64>,
    pub distance_at_t14_31: Option<f64>,
    pub distance_at_decision: Option<f64>,
    pub would_buy: Option<Side>,
    pub actual_outcome: Option<Side>,
    pub would_have_won: Option<bool>,
    pub theoretical_pnl: Option<f64>,
    pub simulated_shares: Option<i64>,
    pub buy_price: Option<f64>,
    pub price_samples: Option<Vec<TrackingSample>>,
    /// Set by the store on first insert
    pub logged_at: Option<DateTime<Utc>>,
}

impl MarketRecord {
    /// Empty record for a market carrying its identity and beat fields
    pub fn for_market(market: &MarketDescriptor, decision: Decision) -> Self {
        Self {
            market_id: market.id.clone(),
            market_slug: Some(market.slug.clone()),
            start_time: Some(market.start_time),
            end_time: Some(market.end_time),
            beat_price: market.beat_price,
            price_before_beat: market.price_before_beat,
            price_after_beat: market.price_after_beat,
            decision,
            skip_reason: None,
            price_at_t14_31: None,
            price_at_t14_45: None,
            price_at_t14_55: None,
            price_at_t14_58: None,
            price_at_t14_59: None,
            current_price: None,
            distance_at_t14_31: None,
            distance_at_decision: None,
            would_buy: None,
            actual_outcome: None,
            would_have_won: None,
            theoretical_pnl: None,
            simulated_shares: None,
            buy_price: None,
            price_samples: None,
            logged_at: None,
        }
    }

    pub fn skipped(market: &MarketDescriptor, reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Self::for_market(market, Decision::Skip)
        }
    }

    pub fn is_skip(&self) -> bool {
        self.decision == Decision::Skip
    }

    /// Field-wise upsert: values present in `newer` win, absent ones keep
    /// what `self` already had. `logged_at` keeps the first value.
    pub fn merge(&mut self, newer: MarketRecord) {
        macro_rules! keep_or_replace {
            ($($field:ident),* $(,)?) => {
                $( if newer.$field.is_some() { self.$field = newer.$field; } )*
            };
        }

        self.decision = newer.decision;
        keep_or_replace!(
            market_slug,
            start_time,
            end_time,
            beat_price,
            price_before_beat,
            price_after_beat,
            skip_reason,
            price_at_t14_31,
            price_at_t14_45,
            price_at_t14_55,
            price_at_t14_58,
            price_at_t14_59,
            current_price,
            distance_at_t14_31,
            distance_at_decision,
            would_buy,
            actual_outcome,
            would_have_won,
            theoretical_pnl,
            simulated_shares,
            buy_price,
            price_samples,
        );
        if self.logged_at.is_none() {
            self.logged_at = newer.logged_at;
        }
    }
}
