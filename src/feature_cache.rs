// =============================================================================
// Feature Cache & Indicators (C4)
// =============================================================================
//
// Per-symbol rolling state and derived features (§4.4), computed by wrapping
// the teacher's pure indicator functions (`indicators::{rsi,atr}`, kept
// unchanged) around a fixed-size price ring, refreshed incrementally on every
// tick rather than recomputed from a stored window each call.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::domain::FeatureVector;
use crate::indicators::{atr, rsi};
use crate::market_data::Candle;
use crate::types::Symbol;

const DEFAULT_WINDOW: usize = 100;

struct SymbolState {
    prices: Vec<f64>,
    bars: Vec<Candle>,
    last_update_ns: i64,
}

impl SymbolState {
    fn new() -> Self {
        Self {
            prices: Vec::with_capacity(DEFAULT_WINDOW),
            bars: Vec::new(),
            last_update_ns: 0,
        }
    }

    fn push_price(&mut self, price: f64, ts_ns: i64) {
        self.prices.push(price);
        if self.prices.len() > DEFAULT_WINDOW {
            self.prices.remove(0);
        }
        self.last_update_ns = ts_ns;
    }
}

pub struct FeatureCache {
    state: RwLock<HashMap<Symbol, SymbolState>>,
    staleness_threshold_s: f64,
}

impl FeatureCache {
    pub fn new(staleness_threshold_s: f64) -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            staleness_threshold_s,
        }
    }

    pub fn on_tick(&self, symbol: &Symbol, price: f64, ts_ns: i64) {
        let mut map = self.state.write();
        map.entry(symbol.clone())
            .or_insert_with(SymbolState::new)
            .push_price(price, ts_ns);
    }

    /// Record a closed bar for ATR_14 purposes. The teacher's `atr.rs` works
    /// over OHLC candles; tick-by-tick price alone cannot drive it, so the
    /// Market Feed or Strategy Engine supplies bars separately from raw
    /// ticks.
    pub fn on_bar(&self, symbol: &Symbol, bar: Candle) {
        let mut map = self.state.write();
        let s = map.entry(symbol.clone()).or_insert_with(SymbolState::new);
        s.bars.push(bar);
        if s.bars.len() > DEFAULT_WINDOW {
            s.bars.remove(0);
        }
    }

    /// Compute the full [`FeatureVector`] for `symbol` as of `now_ns`.
    pub fn compute(&self, symbol: &Symbol, now_ns: i64) -> Option<FeatureVector> {
        let map = self.state.read();
        let s = map.get(symbol)?;
        if s.prices.is_empty() {
            return None;
        }

        let staleness_seconds = (now_ns - s.last_update_ns) as f64 / 1_000_000_000.0;
        let last = *s.prices.last().unwrap();

        let returns = |k: usize| -> Option<f64> {
            if s.prices.len() <= k {
                return None;
            }
            let past = s.prices[s.prices.len() - 1 - k];
            if past == 0.0 {
                None
            } else {
                Some((last - past) / past)
            }
        };

        let ma_20 = last_n_mean(&s.prices, 20);
        let volatility = last_n_stddev(&s.prices, 20);
        let z_score_60 = {
            let mean_60 = last_n_mean(&s.prices, 60);
            let std_60 = last_n_price_stddev(&s.prices, 60);
            match (mean_60, std_60) {
                (Some(mean), Some(std)) if std > 0.0 => Some((last - mean) / std),
                _ => None,
            }
        };

        let rsi_14 = {
            let series = rsi::calculate_rsi(&s.prices, 14);
            series.last().copied()
        };

        let atr_14 = atr::calculate_atr(&s.bars, 14);

        Some(FeatureVector {
            symbol: symbol.clone(),
            computed_at: Utc::now(),
            window_size: s.prices.len(),
            price_history: s.prices.clone(),
            returns_1: returns(1),
            returns_5: returns(5),
            returns_10: returns(10),
            ma_20,
            rsi_14,
            volatility,
            z_score_60,
            atr_14,
            staleness_seconds,
        })
    }

    /// `true` if this symbol's features are past the staleness policy.
    pub fn is_stale(&self, symbol: &Symbol, now_ns: i64) -> bool {
        let map = self.state.read();
        match map.get(symbol) {
            Some(s) if s.last_update_ns > 0 => {
                let staleness = (now_ns - s.last_update_ns) as f64 / 1_000_000_000.0;
                staleness > self.staleness_threshold_s
            }
            _ => true,
        }
    }
}

fn last_n_mean(prices: &[f64], n: usize) -> Option<f64> {
    if prices.len() < n {
        return None;
    }
    let window = &prices[prices.len() - n..];
    Some(window.iter().sum::<f64>() / n as f64)
}

fn last_n_stddev(prices: &[f64], n: usize) -> Option<f64> {
    if prices.len() < n {
        return None;
    }
    let window = &prices[prices.len() - n..];
    let returns: Vec<f64> = window
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Sample standard deviation of the last `n` raw prices (not returns), used
/// as the `z_score_60` denominator so numerator and denominator share units.
fn last_n_price_stddev(prices: &[f64], n: usize) -> Option<f64> {
    if prices.len() < n {
        return None;
    }
    let window = &prices[prices.len() - n..];
    let mean = window.iter().sum::<f64>() / n as f64;
    let variance = window.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_returns_none_without_any_ticks() {
        let cache = FeatureCache::new(60.0);
        assert!(cache.compute(&Symbol::new("BTCUSDT"), 0).is_none());
    }

    #[test]
    fn returns_1_computed_after_two_ticks() {
        let cache = FeatureCache::new(60.0);
        let sym = Symbol::new("BTCUSDT");
        cache.on_tick(&sym, 100.0, 0);
        cache.on_tick(&sym, 110.0, 1_000_000_000);
        let fv = cache.compute(&sym, 1_000_000_000).unwrap();
        assert!((fv.returns_1.unwrap() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn staleness_flag_follows_threshold() {
        let cache = FeatureCache::new(10.0);
        let sym = Symbol::new("BTCUSDT");
        cache.on_tick(&sym, 100.0, 0);
        assert!(!cache.is_stale(&sym, 5_000_000_000));
        assert!(cache.is_stale(&sym, 20_000_000_000));
    }
}
