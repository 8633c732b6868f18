//! Health check HTTP server.
//!
//! Serves /health, /ready and /live. The response is assembled from live
//! component state: per-channel transport status, pipeline counters,
//! persistence totals and backfill activity. Only the database flag is
//! pushed in, by the probe loop in main.

use crate::alpaca::ChannelState;
use crate::backfill::BackfillCoordinator;
use crate::store::CandleStore;
use crate::stream::StreamMetrics;
use crate::subscriptions::SubscriptionSet;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Health check response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy, degraded, or unhealthy
    pub status: HealthStatus,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Batches drained from the message buffer
    pub batches_processed: u64,
    /// Raw stream messages folded
    pub messages_processed: u64,
    /// Messages waiting in the buffer after the last batch
    pub buffer_depth: u64,
    /// Candle rows written to the database
    pub candles_written: u64,
    /// Save batches that failed and were dropped
    pub write_failures: u64,
    /// Symbols currently subscribed across both channels
    pub subscribed_symbols: usize,
    /// Backfill requests that acquired the queued flag
    pub backfills_requested: u64,
    /// Database connection status
    pub database_connected: bool,
    /// Equities stream status
    pub equities: ChannelReport,
    /// Crypto stream status
    pub crypto: ChannelReport,
    /// Seconds since a batch was last processed
    pub seconds_since_last_batch: Option<u64>,
    /// Current memory usage in MB
    pub memory_mb: f64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelReport {
    pub connected: bool,
    pub authenticated: bool,
}

/// Health status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Shared state for health checks.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthStateInner>,
}

struct HealthStateInner {
    start_time: Instant,
    equities: Arc<ChannelState>,
    crypto: Arc<ChannelState>,
    store: Arc<CandleStore>,
    subscriptions: Arc<SubscriptionSet>,
    coordinator: Arc<BackfillCoordinator>,
    metrics: Arc<StreamMetrics>,
    /// Set by the database probe loop
    db_connected: RwLock<bool>,
    /// Memory limit in MB before the service reports degraded
    memory_limit_mb: f64,
}

impl HealthState {
    pub fn new(
        equities: Arc<ChannelState>,
        crypto: Arc<ChannelState>,
        store: Arc<CandleStore>,
        subscriptions: Arc<SubscriptionSet>,
        coordinator: Arc<BackfillCoordinator>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(HealthStateInner {
                start_time: Instant::now(),
                equities,
                crypto,
                store,
                subscriptions,
                coordinator,
                metrics,
                db_connected: RwLock::new(false),
                memory_limit_mb: 512.0,
            }),
        }
    }

    /// Update database connection status.
    pub fn set_db_connected(&self, connected: bool) {
        *self.inner.db_connected.write() = connected;
    }

    /// Ready means the database is reachable and at least one stream is
    /// authenticated.
    pub fn is_ready(&self) -> bool {
        let db_connected = *self.inner.db_connected.read();
        db_connected
            && (self.inner.equities.is_authenticated() || self.inner.crypto.is_authenticated())
    }

    /// Build health response.
    pub fn build_response(&self) -> HealthResponse {
        let inner = &self.inner;
        let db_connected = *inner.db_connected.read();
        let equities = ChannelReport {
            connected: inner.equities.is_connected(),
            authenticated: inner.equities.is_authenticated(),
        };
        let crypto = ChannelReport {
            connected: inner.crypto.is_connected(),
            authenticated: inner.crypto.is_authenticated(),
        };
        let memory_mb = get_memory_usage_mb();

        let status = self.determine_status(db_connected, equities, crypto, memory_mb);

        HealthResponse {
            status,
            uptime_seconds: inner.start_time.elapsed().as_secs(),
            batches_processed: inner.metrics.batches_processed(),
            messages_processed: inner.metrics.messages_processed(),
            buffer_depth: inner.metrics.buffer_depth(),
            candles_written: inner.store.candles_written(),
            write_failures: inner.store.write_failures(),
            subscribed_symbols: inner.subscriptions.subscribed_count(),
            backfills_requested: inner.coordinator.requests_sent(),
            database_connected: db_connected,
            equities,
            crypto,
            seconds_since_last_batch: inner.metrics.last_batch_age().map(|age| age.as_secs()),
            memory_mb,
            timestamp: Utc::now(),
        }
    }

    /// Determine overall health status.
    fn determine_status(
        &self,
        db_connected: bool,
        equities: ChannelReport,
        crypto: ChannelReport,
        memory_mb: f64,
    ) -> HealthStatus {
        if !db_connected {
            return HealthStatus::Unhealthy;
        }
        if !equities.connected && !crypto.connected {
            return HealthStatus::Unhealthy;
        }

        // Connected but not (fully) authenticated streams still serve
        // whatever is flowing; report degraded, not dead
        if !equities.authenticated || !crypto.authenticated {
            return HealthStatus::Degraded;
        }

        if memory_mb > self.inner.memory_limit_mb {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

/// Get current memory usage in MB.
fn get_memory_usage_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = content.split_whitespace().nth(1) {
                if let Ok(pages) = rss_pages.parse::<u64>() {
                    let page_size = 4096;
                    return (pages * page_size) as f64 / (1024.0 * 1024.0);
                }
            }
        }
    }
    0.0
}

/// Health check handler.
async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let response = state.build_response();

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Readiness check handler.
async fn ready_handler(State(state): State<HealthState>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check handler.
async fn live_handler() -> StatusCode {
    StatusCode::OK
}

/// Create the health check router.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Run the health check server.
pub async fn run_health_server(port: u16, state: HealthState) -> std::io::Result<()> {
    let app = health_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Health check server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
