//! Error types for the candle feeder service.
//!
//! One service-wide error enum with conversions from the underlying
//! transport, storage and HTTP layers, plus string-context variants for
//! the places where those layers give us nothing structured.

use thiserror::Error;

/// Main error type for the candle feeder service.
#[derive(Error, Debug)]
pub enum FeederError {
    /// WebSocket connection errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Database connection and query errors
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Database pool errors
    #[error("Database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel communication errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Stream authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// HTTP client errors (backfill runner trigger)
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl FeederError {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a channel error with a message.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create an authentication error with a message.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create an HTTP error with a message.
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }
}

/// Result type alias using FeederError.
pub type Result<T> = std::result::Result<T, FeederError>;
