pub mod chainlink_rtds;
pub mod gamma;
pub mod memory_store;
pub mod postgres;
pub mod rtds_message;

pub use chainlink_rtds::{
    FeedConnector, FeedPhase, FeedTransport, PriceSample, PriceStream, StreamSnapshot,
    StreamState, WsConnector,
};
pub use gamma::{GammaClient, GammaMarket};
pub use memory_store::MemoryStore;
pub use postgres::PostgresStore;
