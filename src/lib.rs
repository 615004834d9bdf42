pub mod adapters;
pub mod cli;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod strategy;

pub use config::AppConfig;
pub use error::{PolywatchError, Result};
