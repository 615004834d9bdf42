pub mod discovery;
pub mod health;
pub mod metrics;

pub use discovery::{predicted_windows, DiscoveryService, PredictedWindow};
pub use health::{router, StatusResponse, StatusServer, StatusState};
pub use metrics::Metrics;
