use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Status server port (default: 8080)
    #[serde(default = "default_status_port")]
    pub status_port: u16,
}

fn default_status_port() -> u16 {
    8080
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            strategy: StrategyConfig::default(),
            settlement: SettlementConfig::default(),
            discovery: DiscoveryConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            status_port: default_status_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// RTDS WebSocket endpoint
    pub ws_url: String,
    /// Topic carrying the Chainlink reference prices
    pub topic: String,
    /// Asset the symbol field must mention (e.g. "btc" for "btc/usd")
    pub asset: String,
    /// A price older than this is treated as unavailable
    pub stale_threshold_secs: u64,
    /// Retention window of the recent-tick buffer
    pub tick_buffer_secs: u64,
    /// Silence longer than this is a dead connection
    pub recv_timeout_secs: u64,
    /// Send an application-level ping every N received messages
    pub keepalive_every: u64,
    /// Delay after an ordinary disconnect
    pub reconnect_delay_secs: u64,
    /// Delay after an unexpected failure
    pub error_delay_secs: u64,
    pub connect_timeout_secs: u64,
    /// How long startup waits for the first price before moving on
    pub startup_wait_secs: u64,
}

impl FeedConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn tick_buffer(&self) -> Duration {
        Duration::from_secs(self.tick_buffer_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-live-data.polymarket.com".to_string(),
            topic: "crypto_prices_chainlink".to_string(),
            asset: "btc".to_string(),
            stale_threshold_secs: 5,
            tick_buffer_secs: 90,
            recv_timeout_secs: 30,
            keepalive_every: 50,
            reconnect_delay_secs: 5,
            error_delay_secs: 10,
            connect_timeout_secs: 10,
            startup_wait_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Skip when the reference price sits within this distance of the beat price
    pub distance_min: f64,
    /// Skip when the reference price is further than this from the beat price
    pub distance_max: f64,
    /// Tracking starts this many seconds before market close
    pub tracking_start_secs: u64,
    /// One-second ticks sampled during tracking
    pub tracking_ticks: usize,
    /// Simulated limit price
    pub buy_price: f64,
    /// Simulated share count for theoretical P&L
    pub simulated_shares: i64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            distance_min: 15.0,
            distance_max: 125.0,
            tracking_start_secs: 30,
            tracking_ticks: 29,
            buy_price: 0.99,
            simulated_shares: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl SettlementConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            poll_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Gamma REST base URL
    pub gamma_url: String,
    /// Slugs look like "{slug_prefix}-{unix start}"
    pub slug_prefix: String,
    pub window_minutes: u32,
    /// Current window plus the next `lookahead - 1`
    pub lookahead: u32,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            gamma_url: "https://gamma-api.polymarket.com".to_string(),
            slug_prefix: "btc-updown-15m".to_string(),
            window_minutes: 15,
            lookahead: 4,
            poll_interval_secs: 60,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; records stay in memory when unset
    pub url: Option<String>,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Markets logged within this window are not relaunched after a restart
    pub dedupe_window_hours: u64,
}

impl DatabaseConfig {
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.dedupe_window_hours * 3600)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            dedupe_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Directory for the rolling log file
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: "./data".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("POLYWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (POLYWATCH_FEED__WS_URL, etc.)
            .add_source(
                Environment::with_prefix("POLYWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            // Variables the deployment platform sets directly
            .set_override_option("status_port", std::env::var("PORT").ok())?
            .set_override_option("logging.dir", std::env::var("LOG_DIR").ok())?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?;

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let s = &self.strategy;
        if s.distance_min < 0.0 || s.distance_min >= s.distance_max {
            errors.push(format!(
                "distance_min ({}) must be non-negative and below distance_max ({})",
                s.distance_min, s.distance_max
            ));
        }

        if s.tracking_ticks == 0 || s.tracking_ticks as u64 >= s.tracking_start_secs {
            errors.push(format!(
                "tracking_ticks ({}) must be at least 1 and below tracking_start_secs ({})",
                s.tracking_ticks, s.tracking_start_secs
            ));
        }

        if s.buy_price <= 0.0 || s.buy_price >= 1.0 {
            errors.push("buy_price must be between 0 and 1".to_string());
        }

        if s.simulated_shares <= 0 {
            errors.push("simulated_shares must be positive".to_string());
        }

        let st = &self.settlement;
        if st.poll_interval_secs == 0 || st.poll_interval_secs > st.poll_timeout_secs {
            errors.push(
                "settlement poll_interval_secs must be positive and at most poll_timeout_secs"
                    .to_string(),
            );
        }

        let f = &self.feed;
        if f.stale_threshold_secs == 0 || f.recv_timeout_secs == 0 || f.keepalive_every == 0 {
            errors.push(
                "feed stale_threshold_secs, recv_timeout_secs and keepalive_every must be positive"
                    .to_string(),
            );
        }

        let d = &self.discovery;
        if d.window_minutes == 0 || d.lookahead == 0 || d.poll_interval_secs == 0 {
            errors.push(
                "discovery window_minutes, lookahead and poll_interval_secs must be positive"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.strategy.distance_min, 15.0);
        assert_eq!(cfg.strategy.distance_max, 125.0);
        assert_eq!(cfg.strategy.tracking_ticks, 29);
        assert_eq!(cfg.settlement.poll_interval(), Duration::from_secs(15));
        assert_eq!(cfg.settlement.poll_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.feed.stale_threshold(), Duration::from_secs(5));
        assert_eq!(cfg.feed.tick_buffer(), Duration::from_secs(90));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut cfg = AppConfig::default();
        cfg.strategy.distance_min = 200.0;
        cfg.strategy.buy_price = 1.5;
        cfg.strategy.tracking_ticks = 0;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let cfg = AppConfig::load_from("/nonexistent/polywatch-config").unwrap();
        assert_eq!(cfg.discovery.slug_prefix, "btc-updown-15m");
        assert_eq!(cfg.feed.topic, "crypto_prices_chainlink");
    }

    #[test]
    fn test_env_override_uses_single_underscore_prefix() {
        std::env::set_var("POLYWATCH_SETTLEMENT__POLL_TIMEOUT_SECS", "240");
        let cfg = AppConfig::load_from("/nonexistent/polywatch-config").unwrap();
        std::env::remove_var("POLYWATCH_SETTLEMENT__POLL_TIMEOUT_SECS");

        assert_eq!(cfg.settlement.poll_timeout(), Duration::from_secs(240));
        assert_eq!(cfg.settlement.poll_interval(), Duration::from_secs(15));
    }
}
