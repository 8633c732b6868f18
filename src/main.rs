//! Candle Feeder Service
//!
//! Streams live trades and bars from Alpaca and maintains multi-timeframe
//! OHLCV candles in Postgres.
//!
//! ## Features
//! - Dual WebSocket streams (equities and crypto) with fixed-delay reconnect
//! - Batched message draining with client-side 1-minute folding
//! - Higher-timeframe rollups gated on backfill completeness
//! - Watchlist-driven subscription reconciliation
//! - Health check HTTP endpoint
//! - Graceful shutdown on SIGTERM

mod aggregator;
mod alpaca;
mod backfill;
mod bucket;
mod candles;
mod config;
mod errors;
mod health;
mod store;
mod stream;
mod subscriptions;

use crate::aggregator::TimeframeAggregator;
use crate::alpaca::{AlpacaChannel, ChannelRouter};
use crate::backfill::{BackfillCoordinator, BackfillSettings, PgBackfillStore};
use crate::config::Config;
use crate::errors::Result;
use crate::health::HealthState;
use crate::store::CandleStore;
use crate::stream::{BackfillHooks, BatchSettings, StreamMetrics, StreamingClient};
use crate::subscriptions::{AssetClass, SubscriptionSet};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the database connection is probed for the health endpoint.
const DB_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting candle feeder service");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded:");
    info!("  Equities stream: {}", config.equities_stream_url());
    info!("  Crypto stream: {}", config.crypto_stream_url());
    info!(
        "  Database: {}:{}/{}",
        config.database.host, config.database.port, config.database.name
    );
    info!("  Backfill runner: {}", config.backfill_runner_url);
    info!("  Health check port: {}", config.health_check_port);

    // Connect storage
    info!("Connecting to database...");
    let pool = store::connect_pool(&config.database).await?;
    let store = Arc::new(CandleStore::new(pool.clone()));

    let coordinator = Arc::new(BackfillCoordinator::new(
        Arc::new(PgBackfillStore::new(pool.clone(), store.clone())),
        BackfillSettings::from_config(&config),
    ));

    let shutdown = Arc::new(AtomicBool::new(false));

    // Both transport channels feed one buffer and share one auth notify
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let auth_notify = Arc::new(Notify::new());

    let (equities_channel, equities_handle) = AlpacaChannel::new(
        AssetClass::UsEquity,
        config.equities_stream_url(),
        config.api_key.clone(),
        config.api_secret.clone(),
        config.reconnect_delay,
        message_tx.clone(),
        auth_notify.clone(),
    );
    let (crypto_channel, crypto_handle) = AlpacaChannel::new(
        AssetClass::Crypto,
        config.crypto_stream_url(),
        config.api_key.clone(),
        config.api_secret.clone(),
        config.reconnect_delay,
        message_tx,
        auth_notify.clone(),
    );

    let router = Arc::new(ChannelRouter {
        equities: equities_handle.clone(),
        crypto: crypto_handle.clone(),
    });

    let (reset_tx, reset_rx) = mpsc::unbounded_channel();
    let hooks = Arc::new(BackfillHooks::new(coordinator.clone(), reset_tx));
    let subscriptions = Arc::new(SubscriptionSet::new(
        pool.clone(),
        router.clone(),
        hooks,
    ));

    match subscriptions.desired_symbols().await {
        Ok(symbols) => info!("Active watchlists cover {} symbols", symbols.len()),
        Err(e) => warn!("Could not read watchlists at startup: {}", e),
    }

    let metrics = Arc::new(StreamMetrics::default());
    let aggregator = TimeframeAggregator::new(
        store.clone(),
        coordinator.clone(),
        config.open_flush_interval,
    );
    let client = StreamingClient::new(
        store.clone(),
        subscriptions.clone(),
        aggregator,
        message_rx,
        reset_rx,
        metrics.clone(),
        BatchSettings::from_config(&config),
    );

    let health_state = HealthState::new(
        equities_handle.state.clone(),
        crypto_handle.state.clone(),
        store.clone(),
        subscriptions.clone(),
        coordinator.clone(),
        metrics.clone(),
    );
    health_state.set_db_connected(true);

    // Spawn health check server
    let health_handle = tokio::spawn({
        let state = health_state.clone();
        let port = config.health_check_port;
        async move {
            if let Err(e) = health::run_health_server(port, state).await {
                error!("Health server error: {}", e);
            }
        }
    });

    // Spawn transport channels
    let equities_task = tokio::spawn(equities_channel.run());
    let crypto_task = tokio::spawn(crypto_channel.run());

    // Spawn the batch drain loop
    let drain_task = tokio::spawn(client.run(shutdown.clone()));

    // Spawn subscription reconciliation
    let reconcile_task = tokio::spawn({
        let subscriptions = subscriptions.clone();
        let router = router.clone();
        let auth_notify = auth_notify.clone();
        let interval = config.reconcile_interval;
        async move {
            stream::reconcile_loop(subscriptions, router, auth_notify, interval).await;
        }
    });

    // Spawn auth watchdog
    let watchdog_task = tokio::spawn({
        let router = router.clone();
        let timeout = config.auth_timeout;
        async move {
            stream::auth_watchdog(router, timeout).await;
        }
    });

    // Spawn database probe
    let probe_task = tokio::spawn({
        let store = store.clone();
        let health = health_state.clone();
        async move {
            let mut interval = tokio::time::interval(DB_PROBE_INTERVAL);
            loop {
                interval.tick().await;
                health.set_db_connected(store.ping().await);
            }
        }
    });

    // Wait for shutdown signal
    info!("Service started, waiting for shutdown signal...");
    wait_for_shutdown().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    shutdown.store(true, Ordering::SeqCst);
    equities_handle.shutdown();
    crypto_handle.shutdown();

    // Wait for the pipeline to finish its current batch
    let shutdown_timeout = Duration::from_secs(10);
    tokio::select! {
        _ = async {
            let _ = equities_task.await;
            let _ = crypto_task.await;
            let _ = drain_task.await;
        } => {
            info!("Pipeline tasks completed gracefully");
        }
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("Shutdown timeout reached, forcing exit");
        }
    }

    // The periodic tasks hold no pending writes
    reconcile_task.abort();
    watchdog_task.abort();
    probe_task.abort();

    // Abort health server (it doesn't have graceful shutdown)
    health_handle.abort();

    info!("Candle feeder service stopped");
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
