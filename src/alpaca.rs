//! Alpaca websocket transport.
//!
//! One [`AlpacaChannel`] per market data stream (equities, crypto). Each
//! channel owns its socket lifecycle: connect, authenticate, forward data
//! frames into the shared message buffer, and reconnect after a fixed
//! delay on any failure. Control frames (auth results, subscription
//! confirmations, errors) are consumed here; only trades and bars reach
//! the buffer. Outbound frames arrive over a command channel so callers
//! never touch the socket directly.

use crate::errors::{FeederError, Result};
use crate::subscriptions::{AssetClass, SubscriptionAction, SubscriptionSender};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Wire messages from the stream, tagged by the `T` field. Anything the
/// feed sends that we do not consume (quotes, trade corrections, LULD
/// halts) lands on `Unknown` and is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "T")]
pub enum FeedMessage {
    #[serde(rename = "t")]
    Trade(TradeMessage),
    #[serde(rename = "b")]
    Bar(BarMessage),
    #[serde(rename = "success")]
    Success { msg: Option<String> },
    #[serde(rename = "error")]
    Error {
        code: Option<i64>,
        msg: Option<String>,
    },
    #[serde(rename = "subscription")]
    Subscription {
        trades: Option<Vec<String>>,
        bars: Option<Vec<String>>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessage {
    #[serde(rename = "S")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "s")]
    pub size: f64,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BarMessage {
    #[serde(rename = "S")]
    pub symbol: String,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "n")]
    pub trade_count: Option<i64>,
    #[serde(rename = "vw")]
    pub vwap: Option<f64>,
}

/// A data frame plus the channel it arrived on, as buffered for the
/// batch-drain loop.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub class: AssetClass,
    pub message: FeedMessage,
}

pub fn auth_frame(key: &str, secret: &str) -> String {
    serde_json::json!({
        "action": "auth",
        "key": key,
        "secret": secret,
    })
    .to_string()
}

/// Builds a subscribe/unsubscribe frame. Only the crypto stream delivers
/// pre-aggregated bars, so only crypto frames carry a bars list.
pub fn subscription_frame(
    action: SubscriptionAction,
    class: AssetClass,
    symbols: &[String],
) -> String {
    let mut payload = serde_json::json!({
        "action": action.as_str(),
        "trades": symbols,
    });
    if class == AssetClass::Crypto {
        payload["bars"] = serde_json::json!(symbols);
    }
    payload.to_string()
}

/// Connection and authentication state for one channel, shared with the
/// auth watchdog and the health endpoint.
pub struct ChannelState {
    class: AssetClass,
    connected: AtomicBool,
    authenticated: AtomicBool,
    /// Bumped on every successful connect, so observers can detect
    /// reconnects without a callback
    connect_epoch: AtomicU64,
    auth_started: Mutex<Option<Instant>>,
    shutdown: AtomicBool,
}

impl ChannelState {
    pub fn new(class: AssetClass) -> Self {
        Self {
            class,
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            connect_epoch: AtomicU64::new(0),
            auth_started: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn class(&self) -> AssetClass {
        self.class
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn connect_epoch(&self) -> u64 {
        self.connect_epoch.load(Ordering::SeqCst)
    }

    /// True while an auth handshake has been outstanding longer than the
    /// timeout.
    pub fn auth_overdue(&self, timeout: Duration) -> bool {
        self.auth_started
            .lock()
            .map(|started| started.elapsed() > timeout)
            .unwrap_or(false)
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        self.connect_epoch.fetch_add(1, Ordering::SeqCst);
        *self.auth_started.lock() = Some(Instant::now());
    }

    pub(crate) fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
        *self.auth_started.lock() = None;
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        *self.auth_started.lock() = None;
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum ChannelCommand {
    /// Write a raw text frame to the socket
    Send(String),
    /// Force-close the socket; the run loop reconnects after its delay
    Reconnect,
}

/// Cloneable grip on a running channel: its shared state plus the
/// command sender.
#[derive(Clone)]
pub struct ChannelHandle {
    pub state: Arc<ChannelState>,
    pub commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    /// Signal the channel to close its socket and stop reconnecting.
    pub fn shutdown(&self) {
        self.state.request_shutdown();
        let _ = self.commands.send(ChannelCommand::Reconnect);
    }
}

pub struct AlpacaChannel {
    class: AssetClass,
    url: String,
    api_key: String,
    api_secret: String,
    reconnect_delay: Duration,
    state: Arc<ChannelState>,
    message_tx: mpsc::UnboundedSender<InboundMessage>,
    command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    auth_notify: Arc<Notify>,
}

impl AlpacaChannel {
    pub fn new(
        class: AssetClass,
        url: String,
        api_key: String,
        api_secret: String,
        reconnect_delay: Duration,
        message_tx: mpsc::UnboundedSender<InboundMessage>,
        auth_notify: Arc<Notify>,
    ) -> (Self, ChannelHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState::new(class));
        let handle = ChannelHandle {
            state: state.clone(),
            commands: command_tx,
        };
        let channel = Self {
            class,
            url,
            api_key,
            api_secret,
            reconnect_delay,
            state,
            message_tx,
            command_rx,
            auth_notify,
        };
        (channel, handle)
    }

    /// Connect-stream-reconnect loop; exits once shutdown is requested.
    pub async fn run(mut self) {
        loop {
            if self.state.shutdown_requested() {
                break;
            }

            match self.connect_and_stream().await {
                Ok(()) => info!("{} stream closed", self.class),
                Err(e) => error!("{} stream error: {}", self.class, e),
            }

            self.state.mark_disconnected();
            if self.state.shutdown_requested() {
                break;
            }

            info!(
                "Reconnecting {} stream in {}s",
                self.class,
                self.reconnect_delay.as_secs()
            );
            tokio::time::sleep(self.reconnect_delay).await;
        }
        info!("{} stream task ended", self.class);
    }

    async fn connect_and_stream(&mut self) -> Result<()> {
        info!("Connecting to {} stream at {}", self.class, self.url);
        let (ws_stream, _) = connect_async(&self.url).await?;
        let (mut write, mut read) = ws_stream.split();

        self.state.mark_connected();
        write
            .send(Message::Text(auth_frame(&self.api_key, &self.api_secret)))
            .await?;

        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            dispatch_text(
                                self.class,
                                &self.state,
                                &self.message_tx,
                                &self.auth_notify,
                                &text,
                            );
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("{} stream sent close: {:?}", self.class, frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(ChannelCommand::Send(frame)) => {
                            write.send(Message::Text(frame)).await?;
                        }
                        Some(ChannelCommand::Reconnect) => {
                            warn!("Force-closing {} stream on command", self.class);
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
                _ = ping_interval.tick() => {
                    write.send(Message::Ping(vec![])).await?;
                }
            }
        }
    }
}

/// Parses one text frame (the feed sends JSON arrays, single objects on
/// some control paths) and routes each message: control frames handled
/// in place, data frames forwarded to the buffer.
fn dispatch_text(
    class: AssetClass,
    state: &ChannelState,
    message_tx: &mpsc::UnboundedSender<InboundMessage>,
    auth_notify: &Notify,
    text: &str,
) {
    let messages: Vec<FeedMessage> = match serde_json::from_str(text) {
        Ok(messages) => messages,
        Err(_) => match serde_json::from_str::<FeedMessage>(text) {
            Ok(message) => vec![message],
            Err(e) => {
                warn!("Skipping unparseable {} frame: {}", class, e);
                return;
            }
        },
    };

    for message in messages {
        match message {
            FeedMessage::Success { msg } => {
                let msg = msg.unwrap_or_default();
                if msg == "authenticated" {
                    state.mark_authenticated();
                    info!("{} stream authenticated", class);
                    auth_notify.notify_one();
                } else {
                    debug!("{} stream: {}", class, msg);
                }
            }
            FeedMessage::Error { code, msg } => {
                error!(
                    "{} stream error {}: {}",
                    class,
                    code.unwrap_or(0),
                    msg.unwrap_or_default()
                );
            }
            FeedMessage::Subscription { trades, bars } => {
                info!(
                    "{} subscription confirmed: {} trades, {} bars",
                    class,
                    trades.map(|t| t.len()).unwrap_or(0),
                    bars.map(|b| b.len()).unwrap_or(0)
                );
            }
            FeedMessage::Unknown => {}
            data @ (FeedMessage::Trade(_) | FeedMessage::Bar(_)) => {
                // Send fails only when the drain loop is gone (shutdown)
                let _ = message_tx.send(InboundMessage {
                    class,
                    message: data,
                });
            }
        }
    }
}

/// Routes subscription frames to the channel serving each asset class.
pub struct ChannelRouter {
    pub equities: ChannelHandle,
    pub crypto: ChannelHandle,
}

impl ChannelRouter {
    pub fn handle_for(&self, class: AssetClass) -> &ChannelHandle {
        match class {
            AssetClass::UsEquity => &self.equities,
            AssetClass::Crypto => &self.crypto,
        }
    }

    pub fn handles(&self) -> [&ChannelHandle; 2] {
        [&self.equities, &self.crypto]
    }
}

#[async_trait]
impl SubscriptionSender for ChannelRouter {
    async fn send_subscription(
        &self,
        action: SubscriptionAction,
        class: AssetClass,
        symbols: &[String],
    ) -> Result<()> {
        let handle = self.handle_for(class);
        if !handle.state.is_authenticated() {
            return Err(FeederError::auth(format!(
                "{} channel is not authenticated",
                class
            )));
        }

        let frame = subscription_frame(action, class, symbols);
        handle
            .commands
            .send(ChannelCommand::Send(frame))
            .map_err(|_| FeederError::channel(format!("{} channel command queue closed", class)))
    }
}
