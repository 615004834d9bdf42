use thiserror::Error;

/// Main error type for the monitor
#[derive(Error, Debug)]
pub enum PolywatchError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("No message from price stream within {0}s")]
    FeedTimeout(u64),

    #[error("Price stream closed: {0}")]
    FeedClosed(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PolywatchError {
    /// Transport-level failures that end a stream session the ordinary way:
    /// socket errors, silence past the receive bound, or the peer closing.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            PolywatchError::WebSocket(_)
                | PolywatchError::Io(_)
                | PolywatchError::FeedTimeout(_)
                | PolywatchError::FeedClosed(_)
        )
    }
}

/// Result type alias for PolywatchError
pub type Result<T> = std::result::Result<T, PolywatchError>;
