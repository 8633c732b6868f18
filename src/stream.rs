//! The streaming pipeline: buffer, batch fold, rollup, reconcile.
//!
//! One drain loop pulls buffered transport messages in bounded batches,
//! folds trades and bars into per-minute OHLCV, persists the 1-minute
//! base, then drives the higher-timeframe aggregator. Companion loops
//! keep subscriptions reconciled against the watchlists and watch for
//! stuck authentication handshakes. The aggregator is mutated only from
//! the drain loop; everything shared crosses over channels or snapshots.

use crate::aggregator::TimeframeAggregator;
use crate::alpaca::{BarMessage, ChannelCommand, ChannelRouter, FeedMessage, InboundMessage};
use crate::backfill::BackfillCoordinator;
use crate::bucket::{is_regular_trading_hours, minute_floor, Timeframe};
use crate::candles::{CandleKey, CandleUpdate, WriteMode};
use crate::config::Config;
use crate::store::CandleStore;
use crate::subscriptions::{
    AssetClass, SubscriptionHooks, SubscriptionSet, SubscriptionState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Sleep between buffer polls when no messages are waiting.
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// How often the auth watchdog inspects the channels.
const WATCHDOG_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_messages: usize,
    pub time_budget: Duration,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_messages: config.batch_max_messages,
            time_budget: config.batch_time_budget,
        }
    }
}

/// Pipeline counters shared with the health endpoint.
#[derive(Default)]
pub struct StreamMetrics {
    batches_processed: AtomicU64,
    messages_processed: AtomicU64,
    buffer_depth: AtomicU64,
    last_batch: Mutex<Option<Instant>>,
}

impl StreamMetrics {
    pub fn record_batch(&self, messages: usize, buffer_depth: usize) {
        self.batches_processed.fetch_add(1, Ordering::SeqCst);
        self.messages_processed
            .fetch_add(messages as u64, Ordering::SeqCst);
        self.buffer_depth.store(buffer_depth as u64, Ordering::SeqCst);
        *self.last_batch.lock() = Some(Instant::now());
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::SeqCst)
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::SeqCst)
    }

    pub fn buffer_depth(&self) -> u64 {
        self.buffer_depth.load(Ordering::SeqCst)
    }

    pub fn last_batch_age(&self) -> Option<Duration> {
        self.last_batch.lock().map(|at| at.elapsed())
    }
}

/// Result of folding one batch of raw messages into 1-minute updates.
struct FoldOutcome {
    minutes: HashMap<CandleKey, CandleUpdate>,
    latest_minute: Option<DateTime<Utc>>,
    dropped_unknown: usize,
    dropped_off_hours: usize,
}

/// Folds raw trades and bars into per-(asset, minute) OHLCV updates.
///
/// Trades set the open on first sight, widen high/low, move the close and
/// add volume. Bars are authoritative: a bar replaces whatever trades
/// built for its minute, and later trades for that minute are ignored.
/// Equity trades outside regular trading hours are dropped; crypto trades
/// never are. Symbols missing from the subscription caches are dropped.
fn fold_batch(batch: &[InboundMessage], subs: &SubscriptionState) -> FoldOutcome {
    let mut minutes: HashMap<CandleKey, CandleUpdate> = HashMap::new();
    let mut bar_keys: HashSet<CandleKey> = HashSet::new();
    let mut latest_minute: Option<DateTime<Utc>> = None;
    let mut dropped_unknown = 0;
    let mut dropped_off_hours = 0;

    for inbound in batch {
        match &inbound.message {
            FeedMessage::Trade(trade) => {
                let asset_id = match subs.asset_ids.get(&trade.symbol) {
                    Some(&id) => id,
                    None => {
                        dropped_unknown += 1;
                        continue;
                    }
                };
                if inbound.class != AssetClass::Crypto
                    && !is_regular_trading_hours(trade.timestamp)
                {
                    dropped_off_hours += 1;
                    continue;
                }

                let key = CandleKey::new(asset_id, minute_floor(trade.timestamp));
                if bar_keys.contains(&key) {
                    continue;
                }
                minutes
                    .entry(key)
                    .or_default()
                    .apply_trade(trade.price, trade.size);
                latest_minute = Some(match latest_minute {
                    Some(ts) => ts.max(key.bucket),
                    None => key.bucket,
                });
            }
            FeedMessage::Bar(bar) => {
                let asset_id = match subs.asset_ids.get(&bar.symbol) {
                    Some(&id) => id,
                    None => {
                        dropped_unknown += 1;
                        continue;
                    }
                };

                let key = CandleKey::new(asset_id, minute_floor(bar.timestamp));
                minutes.insert(key, minute_from_bar(bar));
                bar_keys.insert(key);
                latest_minute = Some(match latest_minute {
                    Some(ts) => ts.max(key.bucket),
                    None => key.bucket,
                });
            }
            // Control frames are consumed by the transport layer
            _ => {}
        }
    }

    FoldOutcome {
        minutes,
        latest_minute,
        dropped_unknown,
        dropped_off_hours,
    }
}

fn minute_from_bar(bar: &BarMessage) -> CandleUpdate {
    CandleUpdate {
        open: Some(bar.open),
        high: Some(bar.high),
        low: Some(bar.low),
        close: Some(bar.close),
        volume: bar.volume,
        trade_count: bar.trade_count,
        vwap: bar.vwap,
        minute_candle_ids: Vec::new(),
    }
}

/// The batch-drain loop. Sole mutator of the aggregator.
pub struct StreamingClient {
    store: Arc<CandleStore>,
    subscriptions: Arc<SubscriptionSet>,
    aggregator: TimeframeAggregator,
    message_rx: mpsc::UnboundedReceiver<InboundMessage>,
    reset_rx: mpsc::UnboundedReceiver<i64>,
    metrics: Arc<StreamMetrics>,
    batch: BatchSettings,
}

impl StreamingClient {
    pub fn new(
        store: Arc<CandleStore>,
        subscriptions: Arc<SubscriptionSet>,
        aggregator: TimeframeAggregator,
        message_rx: mpsc::UnboundedReceiver<InboundMessage>,
        reset_rx: mpsc::UnboundedReceiver<i64>,
        metrics: Arc<StreamMetrics>,
        batch: BatchSettings,
    ) -> Self {
        Self {
            store,
            subscriptions,
            aggregator,
            message_rx,
            reset_rx,
            metrics,
            batch,
        }
    }

    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(
            "Batch drain loop started (max {} messages / {}ms per batch)",
            self.batch.max_messages,
            self.batch.time_budget.as_millis()
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Newly scheduled backfills invalidate in-flight buckets;
            // apply those resets before folding anything else
            while let Ok(asset_id) = self.reset_rx.try_recv() {
                self.aggregator.reset_for_asset(asset_id);
            }

            let batch = match self.drain_batch().await {
                Some(batch) => batch,
                None => break,
            };
            if batch.is_empty() {
                continue;
            }

            self.process_batch(batch).await;
        }

        info!("Batch drain loop stopped");
    }

    /// Pulls one batch: blocks until a first message arrives (or the idle
    /// interval passes), then keeps draining until the size cap or time
    /// budget is hit.
    async fn drain_batch(&mut self) -> Option<Vec<InboundMessage>> {
        let first = match tokio::time::timeout(IDLE_SLEEP, self.message_rx.recv()).await {
            Ok(Some(message)) => message,
            // All transport channels dropped their sender
            Ok(None) => return None,
            Err(_) => return Some(Vec::new()),
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + self.batch.time_budget;
        while batch.len() < self.batch.max_messages && Instant::now() < deadline {
            match self.message_rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        Some(batch)
    }

    async fn process_batch(&mut self, batch: Vec<InboundMessage>) {
        let snapshot = self.subscriptions.snapshot();
        self.process_batch_with(batch, &snapshot).await;
    }

    async fn process_batch_with(&mut self, batch: Vec<InboundMessage>, subs: &SubscriptionState) {
        let batch_len = batch.len();
        let outcome = fold_batch(&batch, subs);

        if outcome.dropped_unknown > 0 {
            debug!(
                "Dropped {} messages for symbols outside the subscription caches",
                outcome.dropped_unknown
            );
        }
        if outcome.dropped_off_hours > 0 {
            debug!(
                "Dropped {} equity trades outside regular trading hours",
                outcome.dropped_off_hours
            );
        }

        let latest_minute = match outcome.latest_minute {
            Some(ts) => ts,
            None => {
                self.metrics.record_batch(batch_len, self.message_rx.len());
                return;
            }
        };

        // The 1-minute base goes down first so row ids resolve for the
        // rollup's minute linkage
        self.store
            .save_candles(Timeframe::Min1, outcome.minutes.clone(), WriteMode::Delta)
            .await;

        let keys: Vec<CandleKey> = outcome.minutes.keys().copied().collect();
        let minute_ids = match self.store.fetch_minute_ids(&keys).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not resolve minute row ids: {}", e);
                HashMap::new()
            }
        };

        let touched = self.aggregator.rollup_from_minutes(&outcome.minutes);
        self.aggregator.attach_minute_ids(&minute_ids);
        self.aggregator.persist_open(&touched, latest_minute).await;
        self.aggregator.flush_closed(latest_minute).await;

        self.metrics.record_batch(batch_len, self.message_rx.len());
    }
}

/// Subscription hook wiring new assets into backfill scheduling. Assets
/// actually scheduled get their in-flight buckets reset by the drain
/// loop before its next batch.
pub struct BackfillHooks {
    coordinator: Arc<BackfillCoordinator>,
    reset_tx: mpsc::UnboundedSender<i64>,
}

impl BackfillHooks {
    pub fn new(coordinator: Arc<BackfillCoordinator>, reset_tx: mpsc::UnboundedSender<i64>) -> Self {
        Self {
            coordinator,
            reset_tx,
        }
    }
}

#[async_trait]
impl SubscriptionHooks for BackfillHooks {
    async fn assets_added(&self, asset_ids: Vec<i64>) {
        if asset_ids.is_empty() {
            return;
        }
        let scheduled = self.coordinator.maybe_schedule_for_assets(&asset_ids).await;
        for asset_id in scheduled {
            let _ = self.reset_tx.send(asset_id);
        }
    }
}

/// Periodic subscription reconciliation, nudged early whenever a channel
/// authenticates. Channels that reconnected since the last pass get their
/// confirmed subscriptions cleared first so they are resubscribed.
pub async fn reconcile_loop(
    subscriptions: Arc<SubscriptionSet>,
    router: Arc<ChannelRouter>,
    auth_notify: Arc<Notify>,
    interval: Duration,
) {
    let mut seen_epochs: HashMap<AssetClass, u64> = HashMap::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = auth_notify.notified() => {}
        }

        for handle in router.handles() {
            let class = handle.state.class();
            let epoch = handle.state.connect_epoch();
            if seen_epochs.get(&class).copied().unwrap_or(0) != epoch {
                subscriptions.mark_disconnected(class);
                seen_epochs.insert(class, epoch);
            }
        }

        if !router.handles().iter().any(|h| h.state.is_authenticated()) {
            continue;
        }

        if let Err(e) = subscriptions.reconcile().await {
            warn!("Subscription reconcile failed: {}", e);
        }
    }
}

/// Forces a reconnect on any channel whose auth handshake has been
/// outstanding longer than the timeout.
pub async fn auth_watchdog(router: Arc<ChannelRouter>, timeout: Duration) {
    loop {
        tokio::time::sleep(WATCHDOG_POLL).await;

        for handle in router.handles() {
            let state = &handle.state;
            if state.is_connected() && !state.is_authenticated() && state.auth_overdue(timeout) {
                warn!(
                    "{} stream authentication timed out after {}s, forcing reconnect",
                    state.class(),
                    timeout.as_secs()
                );
                let _ = handle.commands.send(ChannelCommand::Reconnect);
            }
        }
    }
}
