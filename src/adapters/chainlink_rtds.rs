//! Chainlink RTDS WebSocket adapter for the reference price
//!
//! Connects to Polymarket's Real-Time Data Stream, subscribes to the
//! Chainlink price topic and keeps the latest BTC/USD price, its age and a
//! short rolling window of ticks. The receive loop is the only writer; any
//! number of market tasks read copies of the state without waiting on it.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::rtds_message::{parse_frame, Inbound, PriceTick};
use crate::clock::{unix_secs, Clock};
use crate::config::FeedConfig;
use crate::error::{PolywatchError, Result};
use crate::services::metrics::Metrics;
use crate::strategy::PriceSource;

// ---------------------------------------------------------------------------
// Wire protocol types
// ---------------------------------------------------------------------------

/// Subscribe message sent to the RTDS WebSocket
#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    action: &'static str,
    subscriptions: Vec<Subscription<'a>>,
}

#[derive(Debug, Serialize)]
struct Subscription<'a> {
    topic: &'a str,
    #[serde(rename = "type")]
    sub_type: &'static str,
    filters: &'static str,
}

pub fn subscribe_frame(topic: &str) -> Result<String> {
    let msg = SubscribeMessage {
        action: "subscribe",
        subscriptions: vec![Subscription {
            topic,
            sub_type: "*",
            filters: "",
        }],
    };
    Ok(serde_json::to_string(&msg)?)
}

/// Application-level keepalive
pub const KEEPALIVE_FRAME: &str = r#"{"action":"ping"}"#;

// ---------------------------------------------------------------------------
// Stream state
// ---------------------------------------------------------------------------

/// One accepted price update
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSample {
    /// Unix seconds
    pub timestamp: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StreamState {
    pub latest_price: Option<f64>,
    /// Unix seconds of the latest update
    pub latest_timestamp: Option<f64>,
    pub connected: bool,
    /// Ordered by source timestamp, oldest first. Pruned on write only, so
    /// readers clamp to the retention window themselves.
    pub recent: VecDeque<PriceSample>,
}

impl StreamState {
    fn apply(&mut self, sample: PriceSample, cutoff: f64) {
        self.latest_price = Some(sample.price);
        self.latest_timestamp = Some(sample.timestamp);

        // Late frames carrying an older source timestamp go behind newer ones
        let at = self
            .recent
            .iter()
            .rposition(|s| s.timestamp <= sample.timestamp)
            .map_or(0, |i| i + 1);
        self.recent.insert(at, sample);
        self.recent.retain(|s| s.timestamp >= cutoff);
    }

    /// Samples at or after `cutoff`, oldest first
    fn since(&self, cutoff: f64) -> impl Iterator<Item = &PriceSample> + '_ {
        self.recent.iter().filter(move |s| s.timestamp >= cutoff)
    }
}

/// Copy of the stream state as reported by the status surface
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    /// Fresh price, `None` when stale or never seen
    pub price: Option<f64>,
    pub price_available: bool,
    pub last_price: Option<f64>,
    pub ws_connected: bool,
    pub last_update_age_secs: Option<f64>,
    pub tick_count: usize,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// An open price stream connection
#[async_trait]
pub trait FeedTransport: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame. `None` once the peer has closed the stream.
    async fn recv(&mut self) -> Option<Result<String>>;
}

#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedTransport>>;
}

/// Production connector over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| PolywatchError::Internal(format!("Invalid RTDS WebSocket URL: {}", e)))?;
        Ok(Self {
            url,
            connect_timeout,
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self> {
        Self::new(
            &config.ws_url,
            Duration::from_secs(config.connect_timeout_secs),
        )
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn FeedTransport>> {
        info!("Connecting to Chainlink RTDS: {}", self.url);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| PolywatchError::FeedTimeout(self.connect_timeout.as_secs()))??;

        Ok(Box::new(WsTransport { inner: ws_stream }))
    }
}

pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.inner.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!("Received close frame from Chainlink RTDS: {:?}", frame);
                    return None;
                }
                // Binary, pong and raw frames carry no prices
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisory loop
// ---------------------------------------------------------------------------

/// Phases of the reconnect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Connecting,
    Streaming,
    Backoff(Duration),
}

/// Delay before reconnecting after a session ended with `err`
pub fn backoff_for(config: &FeedConfig, err: &PolywatchError) -> Duration {
    if err.is_disconnect() {
        Duration::from_secs(config.reconnect_delay_secs)
    } else {
        Duration::from_secs(config.error_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// Main client
// ---------------------------------------------------------------------------

/// Chainlink reference price stream
pub struct PriceStream {
    config: FeedConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    state: watch::Sender<StreamState>,
}

impl PriceStream {
    pub fn new(config: FeedConfig, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        let (state, _) = watch::channel(StreamState::default());
        Self {
            config,
            clock,
            metrics,
            state,
        }
    }

    fn now_secs(&self) -> f64 {
        unix_secs(self.clock.now())
    }

    /// Latest price, or `None` if there is none yet or it is older than the
    /// staleness threshold
    pub fn price(&self) -> Option<f64> {
        let state = self.state.borrow();
        let price = state.latest_price?;
        let ts = state.latest_timestamp?;
        if self.now_secs() - ts > self.config.stale_threshold().as_secs_f64() {
            return None;
        }
        Some(price)
    }

    pub fn is_available(&self) -> bool {
        self.price().is_some()
    }

    /// Seconds since the last update, infinite if there was none
    pub fn last_update_age(&self) -> f64 {
        match self.state.borrow().latest_timestamp {
            Some(ts) => self.now_secs() - ts,
            None => f64::INFINITY,
        }
    }

    /// Raw socket state, independent of staleness
    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Cutoff for a read over `window`, never wider than the retention window
    fn read_cutoff(&self, window: Duration) -> f64 {
        self.now_secs() - window.min(self.config.tick_buffer()).as_secs_f64()
    }

    /// Ticks of the last `window`, oldest first
    pub fn recent_ticks(&self, window: Duration) -> Vec<PriceSample> {
        let cutoff = self.read_cutoff(window);
        self.state.borrow().since(cutoff).copied().collect()
    }

    /// Ticks still inside the retention window
    pub fn tick_count(&self) -> usize {
        let cutoff = self.read_cutoff(self.config.tick_buffer());
        self.state.borrow().since(cutoff).count()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let price = self.price();
        let age = self.last_update_age();
        let tick_count = self.tick_count();
        let state = self.state.borrow();
        StreamSnapshot {
            price,
            price_available: price.is_some(),
            last_price: state.latest_price,
            ws_connected: state.connected,
            last_update_age_secs: age.is_finite().then_some(age),
            tick_count,
        }
    }

    /// Receiver woken on every state change
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Wait until a fresh price is available, up to `timeout`
    pub async fn wait_for_price(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            while !self.is_available() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        waited.is_ok() && self.is_available()
    }

    fn set_connected(&self, connected: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.connected != connected;
            s.connected = connected;
            changed
        });
    }

    /// Run the connection loop forever. Only cancellation stops it.
    pub async fn run(&self, connector: &dyn FeedConnector) {
        info!(
            "Starting Chainlink RTDS stream for {} on {}",
            self.config.asset, self.config.topic
        );

        let mut phase = FeedPhase::Connecting;
        let mut transport: Option<Box<dyn FeedTransport>> = None;

        loop {
            phase = match phase {
                FeedPhase::Connecting => match connector.connect().await {
                    Ok(t) => {
                        transport = Some(t);
                        self.set_connected(true);
                        FeedPhase::Streaming
                    }
                    Err(e) => self.session_ended(e),
                },
                FeedPhase::Streaming => match transport.take() {
                    Some(mut t) => {
                        let err = match self.listen(t.as_mut()).await {
                            Ok(()) => PolywatchError::FeedClosed("stream ended".into()),
                            Err(e) => e,
                        };
                        self.session_ended(err)
                    }
                    None => FeedPhase::Connecting,
                },
                FeedPhase::Backoff(delay) => {
                    tokio::time::sleep(delay).await;
                    self.metrics.inc_reconnections();
                    FeedPhase::Connecting
                }
            };
        }
    }

    fn session_ended(&self, err: PolywatchError) -> FeedPhase {
        self.set_connected(false);
        let delay = backoff_for(&self.config, &err);
        if err.is_disconnect() {
            warn!("Chainlink RTDS disconnected: {}. Reconnecting in {:?}", err, delay);
        } else {
            warn!(
                "Unexpected Chainlink RTDS error: {}. Reconnecting in {:?}",
                err, delay
            );
        }
        FeedPhase::Backoff(delay)
    }

    /// One connect-and-listen session: subscribe, then receive until the
    /// connection fails, goes silent or is closed by the peer
    async fn listen(&self, transport: &mut dyn FeedTransport) -> Result<()> {
        transport.send(subscribe_frame(&self.config.topic)?).await?;
        info!("Subscribed to {}", self.config.topic);

        let recv_timeout = self.config.recv_timeout();
        let keepalive_every = self.config.keepalive_every.max(1);
        let mut received: u64 = 0;

        loop {
            let frame = match tokio::time::timeout(recv_timeout, transport.recv()).await {
                Err(_) => return Err(PolywatchError::FeedTimeout(recv_timeout.as_secs())),
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => frame?,
            };

            if frame.trim().is_empty() {
                continue;
            }

            self.handle_text(&frame);

            received += 1;
            if received % keepalive_every == 0 {
                transport.send(KEEPALIVE_FRAME.to_string()).await?;
                debug!("Sent keepalive to Chainlink RTDS");
            }
        }
    }

    /// Handle an incoming text frame. Never fails: frames without a usable
    /// price are dropped.
    pub fn handle_text(&self, text: &str) {
        self.metrics.inc_messages();

        match parse_frame(text, &self.config.asset) {
            Some(Inbound::Price(tick)) => self.apply_tick(tick),
            Some(Inbound::Control(kind)) => {
                if kind == "subscribed" {
                    info!("Subscription confirmed: {}", text);
                }
            }
            Some(Inbound::Unusable) | None => {
                self.metrics.inc_dropped();
                debug!(
                    "Unusable Chainlink RTDS message: {}",
                    text.chars().take(200).collect::<String>()
                );
            }
        }
    }

    fn apply_tick(&self, tick: PriceTick) {
        let now = self.now_secs();
        let sample = PriceSample {
            timestamp: tick.timestamp.unwrap_or(now),
            price: tick.price,
        };
        let cutoff = now - self.config.tick_buffer().as_secs_f64();

        self.state.send_modify(|s| s.apply(sample, cutoff));
        self.metrics.inc_price_updates();
        debug!("BTC/USD: ${:.2} (age: {:.1}s)", sample.price, now - sample.timestamp);
    }
}

impl PriceSource for PriceStream {
    fn price(&self) -> Option<f64> {
        PriceStream::price(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
