//! Candle Feeder Library
//!
//! This crate provides components for streaming market trades and bars
//! from Alpaca into Postgres as multi-timeframe OHLCV candles.

pub mod aggregator;
pub mod alpaca;
pub mod backfill;
pub mod bucket;
pub mod candles;
pub mod config;
pub mod errors;
pub mod health;
pub mod store;
pub mod stream;
pub mod subscriptions;

pub use aggregator::TimeframeAggregator;
pub use alpaca::{AlpacaChannel, ChannelHandle, ChannelRouter, FeedMessage, InboundMessage};
pub use backfill::{
    BackfillCoordinator, BackfillSettings, BackfillStore, HistoricalGate, PgBackfillStore,
};
pub use bucket::{floor_to_bucket, is_regular_trading_hours, minute_floor, Timeframe};
pub use candles::{CandleKey, CandleUpdate, WriteMode};
pub use config::Config;
pub use errors::{FeederError, Result};
pub use health::{HealthResponse, HealthState, HealthStatus};
pub use store::{connect_pool, CandleSink, CandleStore};
pub use stream::{BackfillHooks, BatchSettings, StreamMetrics, StreamingClient};
pub use subscriptions::{AssetClass, SubscriptionSet};
