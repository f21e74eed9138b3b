// =============================================================================
// Tick Store (C1)
// =============================================================================
//
// Append-only time series of normalized ticks plus continuously refreshed 1s/5s
// OHLCV rollups. Generalizes the teacher's `market_data::candle_buffer::CandleBuffer`
// ring-per-key idiom from kline candles to raw-tick rollups, and adds the
// idempotency/staleness contract the core requires.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::types::Symbol;

/// A normalized market quote/trade event (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    /// Monotonic, UTC, nanoseconds.
    pub timestamp_ns: i64,
    pub last_price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_size: Option<f64>,
    pub trade_volume_delta: f64,
}

impl Tick {
    /// `bid <= last <= ask` when both sides present.
    pub fn is_well_formed(&self) -> bool {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => b <= self.last_price && self.last_price <= a,
            _ => true,
        }
    }

    fn dedup_key(&self) -> (Symbol, i64, u64) {
        (self.symbol.clone(), self.timestamp_ns, self.last_price.to_bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    Raw,
    S1,
    S5,
    M1,
    M5,
    M15,
}

/// OHLC bar (§3), derived from ticks by time-bucketing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcBar {
    pub bucket_start: i64,
    pub symbol: Symbol,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

const DEDUP_WINDOW: usize = 1000;
const NS_PER_SEC: i64 = 1_000_000_000;

struct SymbolSeries {
    ticks: VecDeque<Tick>,
    recent_dedup: VecDeque<(Symbol, i64, u64)>,
    rollup_1s: VecDeque<OhlcBar>,
    rollup_5s: VecDeque<OhlcBar>,
    latest: Option<Tick>,
}

impl SymbolSeries {
    fn new() -> Self {
        Self {
            ticks: VecDeque::new(),
            recent_dedup: VecDeque::with_capacity(DEDUP_WINDOW),
            rollup_1s: VecDeque::new(),
            rollup_5s: VecDeque::new(),
            latest: None,
        }
    }

    fn seen_recently(&self, key: &(Symbol, i64, u64)) -> bool {
        self.recent_dedup.iter().any(|k| k == key)
    }

    fn remember(&mut self, key: (Symbol, i64, u64)) {
        self.recent_dedup.push_back(key);
        while self.recent_dedup.len() > DEDUP_WINDOW {
            self.recent_dedup.pop_front();
        }
    }

    fn roll_into(bars: &mut VecDeque<OhlcBar>, tick: &Tick, bucket_ns: i64, max_bars: usize) {
        let bucket_start = (tick.timestamp_ns / bucket_ns) * bucket_ns;
        match bars.back_mut() {
            Some(bar) if bar.bucket_start == bucket_start => {
                bar.high = bar.high.max(tick.last_price);
                bar.low = bar.low.min(tick.last_price);
                bar.close = tick.last_price;
                bar.volume += tick.trade_volume_delta.abs();
            }
            _ => {
                bars.push_back(OhlcBar {
                    bucket_start,
                    symbol: tick.symbol.clone(),
                    open: tick.last_price,
                    high: tick.last_price,
                    low: tick.last_price,
                    close: tick.last_price,
                    volume: tick.trade_volume_delta.abs(),
                });
                while bars.len() > max_bars {
                    bars.pop_front();
                }
            }
        }
    }
}

/// Retention limits, expressed in number of retained bars/ticks rather than
/// wall-clock time since the store is in-process (see SPEC_FULL.md §4.1).
pub struct TickStoreConfig {
    pub raw_ticks_per_symbol: usize,
    pub rollup_1s_bars_per_symbol: usize,
    pub rollup_5s_bars_per_symbol: usize,
    pub freshness_window_s: f64,
}

impl Default for TickStoreConfig {
    fn default() -> Self {
        Self {
            raw_ticks_per_symbol: 50_000,
            rollup_1s_bars_per_symbol: 30 * 24 * 3600,
            rollup_5s_bars_per_symbol: 90 * 24 * 3600 / 5,
            freshness_window_s: 60.0,
        }
    }
}

pub struct TickStore {
    series: RwLock<HashMap<Symbol, SymbolSeries>>,
    config: TickStoreConfig,
}

impl TickStore {
    pub fn new(config: TickStoreConfig) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Idempotent w.r.t. the (symbol, ts, last_price) dedup triple.
    pub fn append_batch(&self, ticks: Vec<Tick>) -> Result<usize, CoreError> {
        let mut map = self.series.write();
        let mut accepted = 0;
        for tick in ticks {
            let series = map.entry(tick.symbol.clone()).or_insert_with(SymbolSeries::new);
            let key = tick.dedup_key();
            if series.seen_recently(&key) {
                continue;
            }
            series.remember(key);

            SymbolSeries::roll_into(&mut series.rollup_1s, &tick, NS_PER_SEC, self.config.rollup_1s_bars_per_symbol);
            SymbolSeries::roll_into(&mut series.rollup_5s, &tick, NS_PER_SEC * 5, self.config.rollup_5s_bars_per_symbol);

            series.latest = Some(tick.clone());
            series.ticks.push_back(tick);
            while series.ticks.len() > self.config.raw_ticks_per_symbol {
                series.ticks.pop_front();
            }
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Most recent `last_price`, or `StalePrice` if nothing within the
    /// freshness window.
    pub fn latest_price(&self, symbol: &Symbol, now_ns: i64) -> Result<(f64, i64), CoreError> {
        let map = self.series.read();
        let series = map
            .get(symbol)
            .ok_or_else(|| CoreError::StalePrice(symbol.to_string()))?;
        let tick = series
            .latest
            .as_ref()
            .ok_or_else(|| CoreError::StalePrice(symbol.to_string()))?;
        let age_s = (now_ns - tick.timestamp_ns) as f64 / NS_PER_SEC as f64;
        if age_s > self.config.freshness_window_s {
            return Err(CoreError::StalePrice(symbol.to_string()));
        }
        Ok((tick.last_price, tick.timestamp_ns))
    }

    /// `now - latest tick ts`, in seconds. `None` if the symbol has never
    /// produced a tick.
    pub fn staleness(&self, symbol: &Symbol, now_ns: i64) -> Option<f64> {
        let map = self.series.read();
        map.get(symbol)
            .and_then(|s| s.latest.as_ref())
            .map(|t| (now_ns - t.timestamp_ns) as f64 / NS_PER_SEC as f64)
    }

    /// Return bars/ticks in `[from_ts, to_ts)` at the requested granularity.
    /// Coarser granularities than the materialized 1s/5s rollups are derived
    /// on read by re-bucketing the finer rollup.
    pub fn window(&self, symbol: &Symbol, from_ts: i64, to_ts: i64, granularity: Granularity) -> Vec<OhlcBar> {
        let map = self.series.read();
        let Some(series) = map.get(symbol) else {
            return Vec::new();
        };

        match granularity {
            Granularity::Raw => series
                .ticks
                .iter()
                .filter(|t| t.timestamp_ns >= from_ts && t.timestamp_ns < to_ts)
                .map(|t| OhlcBar {
                    bucket_start: t.timestamp_ns,
                    symbol: t.symbol.clone(),
                    open: t.last_price,
                    high: t.last_price,
                    low: t.last_price,
                    close: t.last_price,
                    volume: t.trade_volume_delta.abs(),
                })
                .collect(),
            Granularity::S1 => Self::filter_bars(&series.rollup_1s, from_ts, to_ts),
            Granularity::S5 => Self::filter_bars(&series.rollup_5s, from_ts, to_ts),
            Granularity::M1 => Self::rebucket(&series.rollup_5s, from_ts, to_ts, 60 * NS_PER_SEC),
            Granularity::M5 => Self::rebucket(&series.rollup_5s, from_ts, to_ts, 300 * NS_PER_SEC),
            Granularity::M15 => Self::rebucket(&series.rollup_5s, from_ts, to_ts, 900 * NS_PER_SEC),
        }
    }

    fn filter_bars(bars: &VecDeque<OhlcBar>, from_ts: i64, to_ts: i64) -> Vec<OhlcBar> {
        bars.iter()
            .filter(|b| b.bucket_start >= from_ts && b.bucket_start < to_ts)
            .cloned()
            .collect()
    }

    fn rebucket(source: &VecDeque<OhlcBar>, from_ts: i64, to_ts: i64, bucket_ns: i64) -> Vec<OhlcBar> {
        let mut out: Vec<OhlcBar> = Vec::new();
        for bar in source.iter().filter(|b| b.bucket_start >= from_ts && b.bucket_start < to_ts) {
            let bucket_start = (bar.bucket_start / bucket_ns) * bucket_ns;
            match out.last_mut() {
                Some(last) if last.bucket_start == bucket_start => {
                    last.high = last.high.max(bar.high);
                    last.low = last.low.min(bar.low);
                    last.close = bar.close;
                    last.volume += bar.volume;
                }
                _ => out.push(OhlcBar {
                    bucket_start,
                    symbol: bar.symbol.clone(),
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                }),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, ts_ns: i64, price: f64) -> Tick {
        Tick {
            symbol: Symbol::new(symbol),
            timestamp_ns: ts_ns,
            last_price: price,
            bid: Some(price - 0.5),
            ask: Some(price + 0.5),
            bid_size: Some(1.0),
            ask_size: Some(1.0),
            trade_volume_delta: 0.1,
        }
    }

    #[test]
    fn append_batch_dedups_exact_triples() {
        let store = TickStore::new(TickStoreConfig::default());
        let t = tick("BTCUSDT", 1_000_000_000, 50_000.0);
        let accepted1 = store.append_batch(vec![t.clone()]).unwrap();
        let accepted2 = store.append_batch(vec![t]).unwrap();
        assert_eq!(accepted1, 1);
        assert_eq!(accepted2, 0);
    }

    #[test]
    fn latest_price_rejects_stale_reads() {
        let store = TickStore::new(TickStoreConfig::default());
        let sym = Symbol::new("BTCUSDT");
        store.append_batch(vec![tick("BTCUSDT", 0, 50_000.0)]).unwrap();
        let fresh = store.latest_price(&sym, 10 * NS_PER_SEC);
        assert!(fresh.is_ok());
        let stale = store.latest_price(&sym, 120 * NS_PER_SEC);
        assert!(matches!(stale, Err(CoreError::StalePrice(_))));
    }

    #[test]
    fn rollup_1s_aggregates_into_buckets() {
        let store = TickStore::new(TickStoreConfig::default());
        let sym = Symbol::new("BTCUSDT");
        store
            .append_batch(vec![
                tick("BTCUSDT", 0, 100.0),
                tick("BTCUSDT", 500_000_000, 105.0),
                tick("BTCUSDT", NS_PER_SEC, 110.0),
            ])
            .unwrap();
        let bars = store.window(&sym, 0, 2 * NS_PER_SEC, Granularity::S1);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].high, 105.0);
        assert_eq!(bars[0].close, 105.0);
    }

    #[test]
    fn staleness_none_for_unknown_symbol() {
        let store = TickStore::new(TickStoreConfig::default());
        assert_eq!(store.staleness(&Symbol::new("DOGEUSDT"), 0), None);
    }
}
