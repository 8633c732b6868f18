//! Configuration module for the candle feeder service.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Only the database password and the Alpaca key pair are required.

use crate::errors::{FeederError, Result};
use std::env;
use std::time::Duration;

/// Main configuration struct for the candle feeder.
#[derive(Debug, Clone)]
pub struct Config {
    /// Alpaca API key id (APCA_API_KEY_ID)
    pub api_key: String,

    /// Alpaca API secret (APCA_API_SECRET_KEY)
    pub api_secret: String,

    /// Use the sandbox stream host instead of production
    pub sandbox: bool,

    /// Equities feed segment of the stream path (iex or sip)
    pub equities_feed: String,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Backfill runner service URL
    pub backfill_runner_url: String,

    /// Maximum messages drained per batch
    pub batch_max_messages: usize,

    /// Time budget for draining one batch
    pub batch_time_budget: Duration,

    /// Minimum interval between open-bucket flushes per timeframe
    pub open_flush_interval: Duration,

    /// Latest-1-minute-data age beyond which a backfill is scheduled
    pub backfill_staleness: Duration,

    /// Per-asset cooldown between backfill requests
    pub backfill_cooldown: Duration,

    /// TTL on the queued backfill flag
    pub backfill_queued_ttl: Duration,

    /// How long a connection may sit unauthenticated before being recycled
    pub auth_timeout: Duration,

    /// Interval of the subscription reconcile loop
    pub reconcile_interval: Duration,

    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Health check HTTP server port
    pub health_check_port: u16,
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_max: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            api_key: env::var("APCA_API_KEY_ID")
                .map_err(|_| FeederError::config("APCA_API_KEY_ID is required"))?,

            api_secret: env::var("APCA_API_SECRET_KEY")
                .map_err(|_| FeederError::config("APCA_API_SECRET_KEY is required"))?,

            sandbox: env::var("ALPACA_SANDBOX")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),

            equities_feed: env::var("EQUITIES_FEED").unwrap_or_else(|_| "iex".to_string()),

            database: DatabaseConfig {
                host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("DB_PORT")
                    .unwrap_or_else(|_| "5432".to_string())
                    .parse()
                    .map_err(|_| FeederError::config("Invalid DB_PORT"))?,
                name: env::var("DB_NAME").unwrap_or_else(|_| "marketdata".to_string()),
                user: env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: env::var("DB_PASSWORD")
                    .map_err(|_| FeederError::config("DB_PASSWORD is required"))?,
                pool_max: env::var("DB_POOL_MAX")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },

            backfill_runner_url: env::var("BACKFILL_RUNNER_URL")
                .unwrap_or_else(|_| "http://backfill-runner:9000/backfill".to_string()),

            batch_max_messages: env::var("BATCH_MAX_MESSAGES")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .unwrap_or(2000),

            batch_time_budget: Duration::from_millis(
                env::var("BATCH_TIME_BUDGET_MS")
                    .unwrap_or_else(|_| "150".to_string())
                    .parse()
                    .unwrap_or(150),
            ),

            open_flush_interval: Duration::from_millis(
                env::var("OPEN_FLUSH_INTERVAL_MS")
                    .unwrap_or_else(|_| "250".to_string())
                    .parse()
                    .unwrap_or(250),
            ),

            backfill_staleness: Duration::from_secs(
                env::var("BACKFILL_STALENESS_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            ),

            backfill_cooldown: Duration::from_secs(
                env::var("BACKFILL_COOLDOWN_SECS")
                    .unwrap_or_else(|_| "900".to_string())
                    .parse()
                    .unwrap_or(900),
            ),

            backfill_queued_ttl: Duration::from_secs(
                env::var("BACKFILL_QUEUED_TTL_SECS")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()
                    .unwrap_or(600),
            ),

            auth_timeout: Duration::from_secs(
                env::var("AUTH_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),

            reconcile_interval: Duration::from_secs(
                env::var("RECONCILE_INTERVAL_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            ),

            reconnect_delay: Duration::from_secs(
                env::var("RECONNECT_DELAY_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            ),

            health_check_port: env::var("HEALTH_CHECK_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| FeederError::config("Invalid HEALTH_CHECK_PORT"))?,
        };

        // Surface malformed endpoints at startup rather than on first use
        url::Url::parse(&config.equities_stream_url())?;
        url::Url::parse(&config.crypto_stream_url())?;
        url::Url::parse(&config.backfill_runner_url)?;

        Ok(config)
    }

    fn stream_host(&self) -> &'static str {
        if self.sandbox {
            "stream.data.sandbox.alpaca.markets"
        } else {
            "stream.data.alpaca.markets"
        }
    }

    /// Build the equities WebSocket stream URL.
    pub fn equities_stream_url(&self) -> String {
        format!("wss://{}/v2/{}", self.stream_host(), self.equities_feed)
    }

    /// Build the crypto WebSocket stream URL.
    pub fn crypto_stream_url(&self) -> String {
        format!("wss://{}/v1beta3/crypto/us", self.stream_host())
    }

    /// Build the database connection string.
    pub fn database_url(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.database.host,
            self.database.port,
            self.database.name,
            self.database.user,
            self.database.password
        )
    }
}

impl DatabaseConfig {
    /// Create a deadpool configuration.
    pub fn to_pool_config(&self) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.name.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg
    }
}
