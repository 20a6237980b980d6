// 9.0 feed.rs: streaming price ingestion.
// frames come off a TickSource, symbols are normalized, each tick goes to the
// price cache and is folded into the current one-minute candle.
// 9.1 wire parsing, 9.2 symbol map, 9.3 sources, 9.4 ingestor + reconnect loop.

use crate::candle::{Candle, CandleStore};
use crate::config::FeedConfig;
use crate::price_cache::PriceCache;
use crate::runtime::{is_shutdown, sleep_or_shutdown};
use crate::types::{Price, Symbol, Timestamp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// One trade as it arrived, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTick {
    pub symbol: String,
    pub price: Decimal,
    // venue time in ms, informational only
    pub timestamp: Option<i64>,
}

impl RawTick {
    pub fn new(symbol: &str, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(String),
    #[error("trade is missing field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable price `{0}`")]
    InvalidPrice(String),
    #[error("price {0} is not positive")]
    NonPositivePrice(Decimal),
    #[error("empty symbol")]
    EmptySymbol,
}

// 9.1: wire format
// {"type":"trade","data":[{"s":"OANDA:EUR_USD","p":1.1001,"t":1700000000000}]}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Trades(Vec<RawTick>),
    Ping,
    Other,
}

pub fn parse_frame(text: &str) -> Result<Frame, FeedError> {
    let payload: Value =
        serde_json::from_str(text).map_err(|e| FeedError::InvalidJson(e.to_string()))?;

    match payload.get("type").and_then(Value::as_str) {
        Some("trade") => {
            let Some(data) = payload.get("data").and_then(Value::as_array) else {
                return Err(FeedError::MissingField("data"));
            };
            let mut ticks = Vec::with_capacity(data.len());
            for item in data {
                match parse_trade(item) {
                    Ok(tick) => ticks.push(tick),
                    Err(e) => tracing::debug!(error = %e, "dropping malformed trade"),
                }
            }
            Ok(Frame::Trades(ticks))
        }
        Some("ping") => Ok(Frame::Ping),
        _ => Ok(Frame::Other),
    }
}

fn parse_trade(item: &Value) -> Result<RawTick, FeedError> {
    let symbol = item
        .get("s")
        .and_then(Value::as_str)
        .ok_or(FeedError::MissingField("s"))?;
    let price = match item.get("p") {
        Some(Value::Number(n)) => parse_decimal(&n.to_string())?,
        Some(Value::String(s)) => parse_decimal(s)?,
        Some(other) => return Err(FeedError::InvalidPrice(other.to_string())),
        None => return Err(FeedError::MissingField("p")),
    };
    Ok(RawTick {
        symbol: symbol.to_string(),
        price,
        timestamp: item.get("t").and_then(Value::as_i64),
    })
}

fn parse_decimal(raw: &str) -> Result<Decimal, FeedError> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| FeedError::InvalidPrice(raw.to_string()))
}

pub fn subscribe_message(instrument: &str) -> String {
    serde_json::json!({ "type": "subscribe", "symbol": instrument }).to_string()
}

// 9.2: external instrument name -> canonical symbol

#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    known: HashMap<String, Symbol>,
}

impl SymbolMap {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            known: config
                .instruments
                .iter()
                .map(|i| (i.external.clone(), i.symbol.clone()))
                .collect(),
        }
    }

    /// Configured mapping first, otherwise drop the `VENUE:` prefix and the
    /// `_` / `/` separators and upper-case the rest.
    pub fn normalize(&self, external: &str) -> Option<Symbol> {
        if let Some(symbol) = self.known.get(external) {
            return Some(symbol.clone());
        }
        let bare = external.rsplit(':').next().unwrap_or(external);
        let canonical: String = bare
            .chars()
            .filter(|c| *c != '_' && *c != '/' && !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        if canonical.is_empty() {
            None
        } else {
            Some(Symbol::new(canonical))
        }
    }
}

// 9.3: tick sources

/// A connection to some upstream that yields batches of trades.
#[async_trait]
pub trait TickSource: Send {
    /// Open the connection and subscribe to every instrument.
    async fn connect(&mut self, instruments: &[String]) -> Result<()>;

    /// Next batch of trades. `Ok(None)` means the upstream went away.
    async fn next_batch(&mut self) -> Result<Option<Vec<RawTick>>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket trade stream, Finnhub-style subscribe messages.
pub struct WsTickSource {
    url: String,
    token: Option<String>,
    stream: Option<WsStream>,
}

impl WsTickSource {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            url: config.url.clone(),
            token: config.token.clone(),
            stream: None,
        }
    }

    fn endpoint(&self) -> String {
        match &self.token {
            Some(token) => format!("{}?token={}", self.url, token),
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl TickSource for WsTickSource {
    async fn connect(&mut self, instruments: &[String]) -> Result<()> {
        self.stream = None;
        let (mut ws, _) = connect_async(self.endpoint())
            .await
            .with_context(|| format!("connect feed ws: {}", self.url))?;

        for instrument in instruments {
            ws.send(Message::Text(subscribe_message(instrument).into()))
                .await
                .with_context(|| format!("subscribe {instrument}"))?;
        }
        tracing::info!(url = %self.url, instruments = instruments.len(), "feed connected");
        self.stream = Some(ws);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<RawTick>>> {
        let Some(ws) = self.stream.as_mut() else {
            return Ok(None);
        };

        while let Some(msg) = ws.next().await {
            let msg = msg.context("feed ws read")?;
            let text = match msg {
                Message::Text(t) => t.to_string(),
                Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                Message::Ping(v) => {
                    if let Err(e) = ws.send(Message::Pong(v)).await {
                        tracing::debug!(error = %e, "pong failed, dropping connection");
                        break;
                    }
                    continue;
                }
                Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => break,
            };

            match parse_frame(&text) {
                Ok(Frame::Trades(ticks)) if !ticks.is_empty() => return Ok(Some(ticks)),
                Ok(_) => continue,
                Err(e) => tracing::warn!(error = %e, "ignoring feed frame"),
            }
        }

        self.stream = None;
        Ok(None)
    }
}

#[derive(Debug)]
pub enum FeedMessage {
    Text(String),
    Ticks(Vec<RawTick>),
    Disconnect,
}

/// In-process source driven through a `ChannelFeedHandle`. Used by the
/// simulation binary and by tests.
pub struct ChannelTickSource {
    rx: mpsc::UnboundedReceiver<FeedMessage>,
    connects: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
pub struct ChannelFeedHandle {
    tx: mpsc::UnboundedSender<FeedMessage>,
    connects: Arc<AtomicUsize>,
}

impl ChannelTickSource {
    pub fn new() -> (Self, ChannelFeedHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        (
            Self {
                rx,
                connects: Arc::clone(&connects),
            },
            ChannelFeedHandle { tx, connects },
        )
    }
}

impl ChannelFeedHandle {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(FeedMessage::Text(text.into())).is_ok()
    }

    pub fn send_ticks(&self, ticks: Vec<RawTick>) -> bool {
        self.tx.send(FeedMessage::Ticks(ticks)).is_ok()
    }

    pub fn send_price(&self, symbol: &str, price: Decimal) -> bool {
        self.send_ticks(vec![RawTick::new(symbol, price)])
    }

    pub fn disconnect(&self) -> bool {
        self.tx.send(FeedMessage::Disconnect).is_ok()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TickSource for ChannelTickSource {
    async fn connect(&mut self, _instruments: &[String]) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<RawTick>>> {
        loop {
            match self.rx.recv().await {
                Some(FeedMessage::Ticks(ticks)) => return Ok(Some(ticks)),
                Some(FeedMessage::Text(text)) => match parse_frame(&text) {
                    Ok(Frame::Trades(ticks)) => return Ok(Some(ticks)),
                    Ok(_) => continue,
                    Err(e) => tracing::warn!(error = %e, "ignoring feed frame"),
                },
                Some(FeedMessage::Disconnect) => return Ok(None),
                // every handle dropped: nothing more will ever arrive
                None => std::future::pending::<()>().await,
            }
        }
    }
}

// 9.4: ingestion

#[derive(Clone)]
pub struct FeedIngestor {
    prices: PriceCache,
    candles: Arc<dyn CandleStore>,
    symbols: SymbolMap,
    instruments: Vec<String>,
    backoff: Duration,
}

impl FeedIngestor {
    pub fn new(config: &FeedConfig, prices: PriceCache, candles: Arc<dyn CandleStore>) -> Self {
        Self {
            prices,
            candles,
            symbols: SymbolMap::from_config(config),
            instruments: config.instruments.iter().map(|i| i.external.clone()).collect(),
            backoff: config.reconnect_backoff(),
        }
    }

    /// Apply one tick. Malformed ticks are dropped and logged; nothing else
    /// is touched.
    pub fn ingest(&self, tick: &RawTick, now: Timestamp) -> Option<Candle> {
        let Some(symbol) = self.symbols.normalize(&tick.symbol) else {
            tracing::debug!(error = %FeedError::EmptySymbol, raw = %tick.symbol, "tick dropped");
            return None;
        };
        let Some(price) = Price::new(tick.price) else {
            tracing::debug!(error = %FeedError::NonPositivePrice(tick.price), symbol = %symbol, "tick dropped");
            return None;
        };

        self.prices.update(symbol.clone(), price, now);
        Some(self.candles.upsert_tick(&symbol, price, now))
    }

    pub fn ingest_batch(&self, ticks: &[RawTick], now: Timestamp) -> usize {
        ticks.iter().filter_map(|t| self.ingest(t, now)).count()
    }

    /// Connect, stream, and reconnect after a fixed backoff until shutdown.
    /// Ticks missed while disconnected are not recovered.
    pub async fn run<S: TickSource>(self, mut source: S, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u64 = 0;

        while !is_shutdown(&shutdown) {
            attempt = attempt.wrapping_add(1);
            if let Err(err) = source.connect(&self.instruments).await {
                tracing::warn!(attempt, error = ?err, "feed connect failed, retrying");
                if sleep_or_shutdown(self.backoff, &mut shutdown).await {
                    break;
                }
                continue;
            }

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("feed listener stopping");
                        return;
                    }
                    batch = source.next_batch() => match batch {
                        Ok(Some(ticks)) => {
                            self.ingest_batch(&ticks, Timestamp::now());
                        }
                        Ok(None) => {
                            tracing::warn!(attempt, "feed disconnected");
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(attempt, error = ?err, "feed stream failed");
                            break;
                        }
                    }
                }
            }

            if sleep_or_shutdown(self.backoff, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("feed listener stopped");
    }
}
