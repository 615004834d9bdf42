use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Side of the binary market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    /// Side the reference price currently favours relative to the beat price.
    /// A price exactly at the beat price counts as Down.
    pub fn from_prices(price: f64, beat_price: f64) -> Self {
        if price > beat_price {
            Side::Up
        } else {
            Side::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "Up",
            Side::Down => "Down",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Side {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "Up" | "UP" | "up" => Ok(Side::Up),
            "Down" | "DOWN" | "down" => Ok(Side::Down),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// A 15-minute market as handed over by discovery.
///
/// The beat-price fields are filled in place during beat capture and are
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDescriptor {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub beat_price: Option<f64>,
    #[serde(default)]
    pub price_before_beat: Option<f64>,
    #[serde(default)]
    pub price_after_beat: Option<f64>,
    #[serde(default)]
    pub accepting_orders: bool,
}

impl MarketDescriptor {
    pub fn new(
        id: impl Into<String>,
        slug: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            slug: slug.into(),
            condition_id: None,
            title: None,
            start_time,
            end_time,
            beat_price: None,
            price_before_beat: None,
            price_after_beat: None,
            accepting_orders: false,
        }
    }

    /// Instant at which tracking starts, `lead` before close
    pub fn tracking_start(&self, lead: Duration) -> DateTime<Utc> {
        self.end_time - chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time
    }
}

/// Terminal decision for a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Active,
    Skip,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Active => "ACTIVE",
            Decision::Skip => "SKIP",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Decision {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "ACTIVE" => Ok(Decision::Active),
            "SKIP" => Ok(Decision::Skip),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// Why no simulated trade was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No fresh price when the market was picked up
    ChainlinkUnavailableAtOpen,
    /// Price went missing during the three beat-capture samples
    ChainlinkLostDuringBeatCapture,
    /// No fresh price at tracking start
    ChainlinkUnavailable,
    /// Price went missing on one of the tracking ticks
    ChainlinkLostDuringTracking,
    /// Distance fell below the minimum mid-tracking
    UnstableDuringTracking,
    DistanceTooLarge,
    DistanceTooSmall,
}

impl SkipReason {
    pub const ALL: [SkipReason; 7] = [
        SkipReason::ChainlinkUnavailableAtOpen,
        SkipReason::ChainlinkLostDuringBeatCapture,
        SkipReason::ChainlinkUnavailable,
        SkipReason::ChainlinkLostDuringTracking,
        SkipReason::UnstableDuringTracking,
        SkipReason::DistanceTooLarge,
        SkipReason::DistanceTooSmall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ChainlinkUnavailableAtOpen => "chainlink_unavailable_at_open",
            SkipReason::ChainlinkLostDuringBeatCapture => "chainlink_lost_during_beat_capture",
            SkipReason::ChainlinkUnavailable => "chainlink_unavailable",
            SkipReason::ChainlinkLostDuringTracking => "chainlink_lost_during_tracking",
            SkipReason::UnstableDuringTracking => "unstable_during_tracking",
            SkipReason::DistanceTooLarge => "distance_too_large",
            SkipReason::DistanceTooSmall => "distance_too_small",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SkipReason {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        SkipReason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown skip reason: {s}"))
    }
}

/// One per-second observation taken while tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSample {
    #[serde(rename = "t")]
    pub tick: usize,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub distance: f64,
    pub side: Side,
}

/// Where a market currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    BeatCapture,
    Idle,
    Evaluate,
    Active,
    Decision,
    SettlementWait,
    Log,
}

impl std::fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketPhase::BeatCapture => "beat_capture",
            MarketPhase::Idle => "idle",
            MarketPhase::Evaluate => "evaluate",
            MarketPhase::Active => "active",
            MarketPhase::Decision => "decision",
            MarketPhase::SettlementWait => "settlement_wait",
            MarketPhase::Log => "log",
        };
        write!(f, "{}", s)
    }
}

/// Round to cents, as stored in records
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
