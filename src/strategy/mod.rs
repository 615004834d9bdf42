//! Market lifecycle: beat capture, the per-market controller and the
//! supervisor that runs one controller per market.

pub mod beat_capture;
pub mod controller;
pub mod supervisor;
pub mod traits;

pub use beat_capture::capture_beat_price;
pub use controller::{
    gate_distance, settle, summary_line, LifecycleConfig, MarketContext, MarketController,
};
pub use supervisor::{ActiveMarketInfo, MarketSupervisor};
pub use traits::{OutcomeLookup, PriceSource, RecordSink};
