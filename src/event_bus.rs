// =============================================================================
// Event Bus (C2)
// =============================================================================
//
// One-to-many fanout over bounded per-topic rings, plus a hot per-symbol
// "last tick" cache. Grounded on the teacher's `CandleBuffer` ring-per-key
// idiom (`market_data::candle_buffer`), generalized from candles to arbitrary
// typed topics and given broadcast/consumer-group subscription semantics via
// `tokio::sync::broadcast`, which is already pulled in transitively through
// `tokio`'s "full" feature and matches the publish-never-blocks, consumers-can-
// lag contract in §4.2.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::tick_store::Tick;
use crate::types::Symbol;

pub const TOPIC_TICKS: &str = "ticks";
pub const TOPIC_SIGNALS: &str = "signals";
pub const TOPIC_ORDERS: &str = "orders";
pub const TOPIC_FILLS: &str = "fills";
pub const TOPIC_EVENTS: &str = "events";
pub const TOPIC_AUDIT: &str = "audit";

const DEFAULT_TOPIC_CAPACITY: usize = 10_000;

/// Envelope carried on every topic. Payloads are pre-serialized to JSON at
/// publish time so a single broadcast channel type can carry any topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub seq: u64,
}

struct Topic {
    sender: broadcast::Sender<Event>,
    dropped: AtomicU64,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        Self {
            sender,
            dropped: AtomicU64::new(0),
        }
    }
}

/// One-to-many fanout of ticks, signals, orders, fills, equity snapshots,
/// audit entries, and operational events.
pub struct EventBus {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    capacity: usize,
    seq: AtomicU64,
    last_tick: RwLock<HashMap<Symbol, Tick>>,
    consumer_lag: RwLock<HashMap<String, AtomicU64>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
            seq: AtomicU64::new(0),
            last_tick: RwLock::new(HashMap::new()),
            consumer_lag: RwLock::new(HashMap::new()),
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(t) = self.topics.read().get(name) {
            return t.clone();
        }
        let mut map = self.topics.write();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.capacity)))
            .clone()
    }

    /// Non-blocking publish. Drops the oldest message for lagging subscribers
    /// on overflow -- `broadcast::Sender::send` never awaits, it just returns
    /// an error when there are zero receivers, which we ignore (FIFO-within-
    /// topic ordering is preserved for anyone still subscribed).
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let t = self.topic(topic);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = t.sender.send(Event {
            topic: topic.to_string(),
            payload,
            seq,
        });
    }

    /// Subscribe to a topic. `consumer_group` only affects bookkeeping of the
    /// per-consumer drop counter here; true at-least-once delivery across a
    /// process group is out of scope for a single-process in-memory bus.
    pub fn subscribe(&self, topic: &str, consumer_group: Option<&str>) -> broadcast::Receiver<Event> {
        if let Some(group) = consumer_group {
            self.consumer_lag
                .write()
                .entry(format!("{topic}:{group}"))
                .or_insert_with(|| AtomicU64::new(0));
        }
        self.topic(topic).sender.subscribe()
    }

    /// Record that a consumer in `group` dropped `n` messages (caller detects
    /// this via `RecvError::Lagged` on its receiver).
    pub fn record_drop(&self, topic: &str, consumer_group: &str, n: u64) {
        let key = format!("{topic}:{consumer_group}");
        let map = self.consumer_lag.read();
        if let Some(counter) = map.get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self, topic: &str, consumer_group: &str) -> u64 {
        let key = format!("{topic}:{consumer_group}");
        self.consumer_lag
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Write-through hot cache; also publishes to `ticks`.
    pub fn set_last_tick(&self, tick: Tick) {
        self.last_tick.write().insert(tick.symbol.clone(), tick.clone());
        if let Ok(payload) = serde_json::to_value(&tick) {
            self.publish(TOPIC_TICKS, payload);
        }
    }

    pub fn get_last_tick(&self, symbol: &Symbol) -> Option<Tick> {
        self.last_tick.read().get(symbol).cloned()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tick(symbol: &str, price: f64) -> Tick {
        Tick {
            symbol: Symbol::new(symbol),
            timestamp_ns: 0,
            last_price: price,
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            trade_volume_delta: 0.0,
        }
    }

    #[test]
    fn set_last_tick_updates_hot_cache_and_publishes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(TOPIC_TICKS, None);
        bus.set_last_tick(sample_tick("BTCUSDT", 50_000.0));
        assert_eq!(
            bus.get_last_tick(&Symbol::new("BTCUSDT")).unwrap().last_price,
            50_000.0
        );
        let evt = rx.try_recv().expect("tick should have been published");
        assert_eq!(evt.topic, TOPIC_TICKS);
    }

    #[test]
    fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish(TOPIC_EVENTS, serde_json::json!({"kind": "feed.malformed"}));
    }

    #[test]
    fn sequence_numbers_increase_monotonically_across_topics() {
        let bus = EventBus::new();
        bus.publish(TOPIC_SIGNALS, serde_json::json!({}));
        bus.publish(TOPIC_ORDERS, serde_json::json!({}));
        let mut rx = bus.subscribe(TOPIC_ORDERS, None);
        bus.publish(TOPIC_ORDERS, serde_json::json!({}));
        let evt = rx.try_recv().unwrap();
        assert!(evt.seq >= 2);
    }
}
