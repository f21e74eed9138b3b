// =============================================================================
// Market Feed (C3)
// =============================================================================
//
// A persistent, self-healing WebSocket connection to the exchange that
// produces a clean tick stream (§4.3). Merges the teacher's three separate
// connection loops (`market_data::trade_stream::run_trade_stream`,
// `market_data::orderbook`'s bookTicker handling, and the reconnect-on-error
// shape of `market_data::candle_buffer::run_kline_stream`) into one explicit
// state machine, and adds the dedup/outlier-filter/batch-flush pipeline and
// unified backoff (`backoff.rs`) the teacher's three independent loops never
// shared.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::event_bus::EventBus;
use crate::feature_cache::FeatureCache;
use crate::tick_store::{Tick, TickStore};
use crate::types::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Streaming,
    Degraded,
}

impl FeedState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Subscribing,
            4 => Self::Streaming,
            _ => Self::Degraded,
        }
    }
    fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Default)]
pub struct FeedMetrics {
    pub ticks_total: AtomicU64,
    pub malformed_total: AtomicU64,
    pub dedup_dropped_total: AtomicU64,
    pub outlier_dropped_total: AtomicU64,
    pub reconnect_count: AtomicU64,
}

const DEDUP_WINDOW: usize = 1000;
const OUTLIER_THRESHOLD_PCT: f64 = 0.10;
const FLUSH_MAX_TICKS: usize = 500;
const FLUSH_MAX_INTERVAL: Duration = Duration::from_millis(250);

struct PerSymbolFilter {
    recent_hashes: VecDeque<u64>,
    trailing_prices: VecDeque<f64>,
}

impl PerSymbolFilter {
    fn new() -> Self {
        Self {
            recent_hashes: VecDeque::with_capacity(DEDUP_WINDOW),
            trailing_prices: VecDeque::with_capacity(300),
        }
    }

    fn seen(&mut self, hash: u64) -> bool {
        if self.recent_hashes.contains(&hash) {
            return true;
        }
        self.recent_hashes.push_back(hash);
        if self.recent_hashes.len() > DEDUP_WINDOW {
            self.recent_hashes.pop_front();
        }
        false
    }

    fn median_trailing(&self) -> Option<f64> {
        if self.trailing_prices.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.trailing_prices.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(sorted[sorted.len() / 2])
    }

    fn push_price(&mut self, price: f64) {
        self.trailing_prices.push_back(price);
        if self.trailing_prices.len() > 300 {
            self.trailing_prices.pop_front();
        }
    }
}

pub struct MarketFeed {
    ws_url: String,
    symbols: Vec<Symbol>,
    state: AtomicU8,
    metrics: FeedMetrics,
    tick_store: Arc<TickStore>,
    feature_cache: Arc<FeatureCache>,
    event_bus: Arc<EventBus>,
    heartbeat_interval_s: u64,
    heartbeat_gap_s: u64,
}

impl MarketFeed {
    pub fn new(
        ws_url: impl Into<String>,
        symbols: Vec<Symbol>,
        tick_store: Arc<TickStore>,
        feature_cache: Arc<FeatureCache>,
        event_bus: Arc<EventBus>,
        heartbeat_interval_s: u64,
        heartbeat_gap_s: u64,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            symbols,
            state: AtomicU8::new(FeedState::Disconnected.as_u8()),
            metrics: FeedMetrics::default(),
            tick_store,
            feature_cache,
            event_bus,
            heartbeat_interval_s,
            heartbeat_gap_s,
        }
    }

    pub fn state(&self) -> FeedState {
        FeedState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, s: FeedState) {
        self.state.store(s.as_u8(), Ordering::Relaxed);
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.metrics
    }

    /// Run forever: connect, stream, reconnect on any fatal error with
    /// unified exponential backoff. Returns only if `shutdown` is observed.
    pub async fn run(&self, shutdown: Arc<std::sync::atomic::AtomicBool>) {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig::default());

        while !shutdown.load(Ordering::Relaxed) {
            self.set_state(FeedState::Connecting);
            match self.run_once(&shutdown).await {
                Ok(()) => {
                    info!("market feed loop exited cleanly (shutdown requested)");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "market feed disconnected, reconnecting with backoff");
                    self.metrics.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    self.set_state(FeedState::Disconnected);
                    if let Some(delay) = backoff.next_delay() {
                        tokio::time::sleep(delay).await;
                    } else {
                        backoff.reset();
                    }
                    continue;
                }
            }
        }
        backoff.reset();
    }

    async fn run_once(&self, shutdown: &Arc<std::sync::atomic::AtomicBool>) -> anyhow::Result<()> {
        let (ws_stream, _resp) = connect_async(&self.ws_url).await?;
        self.set_state(FeedState::Connected);
        info!(url = %self.ws_url, "market feed connected");

        let (mut write, mut read) = ws_stream.split();

        self.set_state(FeedState::Subscribing);
        let sub_msg = self.build_subscribe_message();
        write.send(Message::Text(sub_msg)).await?;
        self.set_state(FeedState::Streaming);

        let mut filters: std::collections::HashMap<Symbol, PerSymbolFilter> =
            std::collections::HashMap::new();
        let mut batch: Vec<Tick> = Vec::with_capacity(FLUSH_MAX_TICKS);
        let mut last_flush = Instant::now();
        let heartbeat_deadline = Duration::from_secs(self.heartbeat_gap_s.max(1));

        loop {
            if shutdown.load(Ordering::Relaxed) {
                self.flush(&mut batch);
                return Ok(());
            }

            match timeout(heartbeat_deadline, read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    self.ingest_frame(&text, &mut filters, &mut batch);
                    if batch.len() >= FLUSH_MAX_TICKS || last_flush.elapsed() >= FLUSH_MAX_INTERVAL {
                        self.flush(&mut batch);
                        last_flush = Instant::now();
                    }
                }
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                Ok(Some(Ok(Message::Close(_)))) => {
                    warn!("market feed received close frame");
                    self.flush(&mut batch);
                    return Err(anyhow::anyhow!("exchange closed connection"));
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    self.flush(&mut batch);
                    return Err(e.into());
                }
                Ok(None) => {
                    self.flush(&mut batch);
                    return Err(anyhow::anyhow!("stream ended"));
                }
                Err(_) => {
                    self.flush(&mut batch);
                    self.set_state(FeedState::Degraded);
                    return Err(anyhow::anyhow!(
                        "no inbound frame within heartbeat window ({}s)",
                        self.heartbeat_gap_s
                    ));
                }
            }
        }
    }

    fn build_subscribe_message(&self) -> String {
        let params: Vec<String> = self
            .symbols
            .iter()
            .flat_map(|s| {
                let lower = s.as_str().to_lowercase();
                vec![format!("{lower}@bookTicker"), format!("{lower}@aggTrade")]
            })
            .collect();
        serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        })
        .to_string()
    }

    fn ingest_frame(
        &self,
        text: &str,
        filters: &mut std::collections::HashMap<Symbol, PerSymbolFilter>,
        batch: &mut Vec<Tick>,
    ) {
        let Some(tick) = parse_frame(text) else {
            self.metrics.malformed_total.fetch_add(1, Ordering::Relaxed);
            self.event_bus
                .publish("events", serde_json::json!({"kind": "feed.malformed"}));
            return;
        };

        let filter = filters.entry(tick.symbol.clone()).or_insert_with(PerSymbolFilter::new);

        let hash = dedup_hash(&tick);
        if filter.seen(hash) {
            self.metrics.dedup_dropped_total.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(median) = filter.median_trailing() {
            if median > 0.0 {
                let deviation = (tick.last_price - median).abs() / median;
                if deviation > OUTLIER_THRESHOLD_PCT {
                    self.metrics.outlier_dropped_total.fetch_add(1, Ordering::Relaxed);
                    self.event_bus.publish(
                        "events",
                        serde_json::json!({"kind": "outlier_tick", "symbol": tick.symbol, "deviation": deviation}),
                    );
                    return;
                }
            }
        }
        filter.push_price(tick.last_price);

        self.feature_cache.on_tick(&tick.symbol, tick.last_price, tick.timestamp_ns);
        self.event_bus.set_last_tick(tick.clone());
        self.metrics.ticks_total.fetch_add(1, Ordering::Relaxed);
        batch.push(tick);
    }

    fn flush(&self, batch: &mut Vec<Tick>) {
        if batch.is_empty() {
            return;
        }
        let to_flush = std::mem::take(batch);
        if let Err(e) = self.tick_store.append_batch(to_flush) {
            warn!(error = %e, "tick store append failed, batch dropped");
            self.event_bus
                .publish("events", serde_json::json!({"kind": "TickBatchDropped"}));
        }
    }
}

fn dedup_hash(tick: &Tick) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    tick.symbol.as_str().hash(&mut hasher);
    tick.timestamp_ns.hash(&mut hasher);
    tick.last_price.to_bits().hash(&mut hasher);
    tick.bid.map(f64::to_bits).unwrap_or(0).hash(&mut hasher);
    tick.ask.map(f64::to_bits).unwrap_or(0).hash(&mut hasher);
    hasher.finish()
}

/// Accepts both the `bookTicker` and `aggTrade` channel formats.
fn parse_frame(text: &str) -> Option<Tick> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let data = if root.get("data").is_some() { &root["data"] } else { &root };

    let symbol = data.get("s")?.as_str()?;
    let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);

    // bookTicker: {u, s, b, B, a, A}
    if let (Some(b), Some(a)) = (data.get("b"), data.get("a")) {
        let bid: f64 = b.as_str()?.parse().ok()?;
        let ask: f64 = a.as_str()?.parse().ok()?;
        let bid_size = data.get("B").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
        let ask_size = data.get("A").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
        let last = (bid + ask) / 2.0;
        return Some(Tick {
            symbol: Symbol::new(symbol),
            timestamp_ns: now_ns,
            last_price: last,
            bid: Some(bid),
            ask: Some(ask),
            bid_size,
            ask_size,
            trade_volume_delta: 0.0,
        });
    }

    // aggTrade (deals): {e: "aggTrade", s, p, q, m}
    if data.get("p").is_some() {
        let price: f64 = data.get("p")?.as_str()?.parse().ok()?;
        let qty: f64 = data.get("q").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let is_buyer_maker = data.get("m").and_then(|v| v.as_bool()).unwrap_or(false);
        let signed_qty = if is_buyer_maker { -qty } else { qty };
        return Some(Tick {
            symbol: Symbol::new(symbol),
            timestamp_ns: now_ns,
            last_price: price,
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            trade_volume_delta: signed_qty,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_book_ticker_frame() {
        let json = r#"{"u":1,"s":"BTCUSDT","b":"49990.00","B":"1.0","a":"50010.00","A":"1.0"}"#;
        let tick = parse_frame(json).unwrap();
        assert_eq!(tick.symbol.as_str(), "BTCUSDT");
        assert!(tick.is_well_formed());
    }

    #[test]
    fn parses_agg_trade_frame() {
        let json = r#"{"e":"aggTrade","s":"ETHUSDT","p":"3000.50","q":"0.2","m":false}"#;
        let tick = parse_frame(json).unwrap();
        assert_eq!(tick.symbol.as_str(), "ETHUSDT");
        assert!(tick.trade_volume_delta > 0.0);
    }

    #[test]
    fn malformed_frame_returns_none() {
        assert!(parse_frame("not json").is_none());
        assert!(parse_frame(r#"{"foo": "bar"}"#).is_none());
    }

    #[test]
    fn dedup_filter_rejects_repeat_hash() {
        let mut filter = PerSymbolFilter::new();
        assert!(!filter.seen(42));
        assert!(filter.seen(42));
    }

    #[test]
    fn outlier_filter_flags_large_deviation() {
        let mut filter = PerSymbolFilter::new();
        for _ in 0..50 {
            filter.push_price(100.0);
        }
        let median = filter.median_trailing().unwrap();
        let deviation = (115.0 - median).abs() / median;
        assert!(deviation > OUTLIER_THRESHOLD_PCT);
    }
}
