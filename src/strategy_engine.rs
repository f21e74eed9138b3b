// =============================================================================
// Strategy Engine (C6) — per-symbol entry/exit state machine
// =============================================================================
//
// Restructures the teacher's `strategy.rs::evaluate_symbol` (a stateless
// evaluate-every-5-seconds function) into a genuine per-symbol state machine
// (§4.6), reusing the teacher's indicator/weighted-scoring arithmetic as the
// body of the `Evaluating` phase and the regime detector as the
// `regime_scaler` input.

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::{FeatureVector, Prediction, Signal};
use crate::feature_cache::FeatureCache;
use crate::indicators::ema::calculate_ema;
use crate::model_provider::ModelPolicy;
use crate::regime::MarketRegime;
use crate::types::{Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyProfile {
    Scalp,
    Day,
    Swing,
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileParams {
    pub bar_interval_s: u64,
    pub cooldown_bars: u32,
    pub sl_atr_mult: f64,
    pub tp_atr_mult: f64,
    pub use_adx_filter: bool,
    pub max_spread_bps: f64,
    pub max_latency_ms: u64,
    pub min_vol_bps: f64,
    pub sync_window_bars: u32,
    pub timeout_bars: u32,
}

impl StrategyProfile {
    pub fn params(self) -> ProfileParams {
        match self {
            Self::Scalp => ProfileParams {
                bar_interval_s: 1,
                cooldown_bars: 5,
                sl_atr_mult: 1.0,
                tp_atr_mult: 1.5,
                use_adx_filter: false,
                max_spread_bps: 3.0,
                max_latency_ms: 250,
                min_vol_bps: 2.0,
                sync_window_bars: 2,
                timeout_bars: 20,
            },
            Self::Day => ProfileParams {
                bar_interval_s: 900,
                cooldown_bars: 8,
                sl_atr_mult: 1.5,
                tp_atr_mult: 2.5,
                use_adx_filter: false,
                max_spread_bps: 6.0,
                max_latency_ms: 500,
                min_vol_bps: 1.0,
                sync_window_bars: 3,
                timeout_bars: 40,
            },
            Self::Swing => ProfileParams {
                bar_interval_s: 14_400,
                cooldown_bars: 8,
                sl_atr_mult: 2.0,
                tp_atr_mult: 4.0,
                use_adx_filter: true,
                max_spread_bps: 10.0,
                max_latency_ms: 1000,
                min_vol_bps: 0.5,
                sync_window_bars: 5,
                timeout_bars: 80,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Evaluating,
    InPosition,
    Exiting,
    Cooldown,
}

#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_bar: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Heartbeat {
    pub symbol: String,
    pub state: Phase,
    pub last_tick_ts: i64,
    pub position: Option<(String, f64)>,
    pub pnl: f64,
}

/// What the Evaluating phase produces for a given tick — either nothing, or
/// a candidate [`Signal`] for the Risk gate to evaluate.
pub struct EvalOutcome {
    pub candidate: Option<Signal>,
    pub bar_close_ts: i64,
    pub exit_requested: bool,
}

struct Inner {
    phase: Phase,
    position: Option<OpenPosition>,
    cooldown_bars_remaining: u32,
    bars_seen: u64,
    rsi_prev: Option<f64>,
    last_tick_ts: i64,
}

/// One per symbol. Owned by a single long-lived task (see `engine_manager.rs`).
pub struct StrategyEngine {
    pub symbol: Symbol,
    pub profile: StrategyProfile,
    state: RwLock<Inner>,
}

impl StrategyEngine {
    pub fn new(symbol: Symbol, profile: StrategyProfile) -> Self {
        Self {
            symbol,
            profile,
            state: RwLock::new(Inner {
                phase: Phase::Idle,
                position: None,
                cooldown_bars_remaining: 0,
                bars_seen: 0,
                rsi_prev: None,
                last_tick_ts: 0,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase
    }

    pub fn position(&self) -> Option<OpenPosition> {
        self.state.read().position.clone()
    }

    pub fn heartbeat(&self, last_price: f64) -> Heartbeat {
        let s = self.state.read();
        let pnl = s
            .position
            .as_ref()
            .map(|p| p.side.sign() * (last_price - p.entry_price))
            .unwrap_or(0.0);
        Heartbeat {
            symbol: self.symbol.to_string(),
            state: s.phase,
            last_tick_ts: s.last_tick_ts,
            position: s.position.as_ref().map(|p| (p.side.to_string(), p.entry_price)),
            pnl,
        }
    }

    /// Advance the state machine on one closed bar. Returns a candidate
    /// signal when the Evaluating phase's entry condition fires, or signals
    /// that the open position should be exited.
    pub fn on_bar(
        &self,
        features: &FeatureVector,
        prediction: &Prediction,
        regime: MarketRegime,
        spread_bps: f64,
        latency_ms: u64,
        policy: ModelPolicy,
        bar_close_ts: i64,
        last_price: f64,
        feature_cache: &FeatureCache,
        now_ns: i64,
    ) -> EvalOutcome {
        let params = self.profile.params();
        let mut s = self.state.write();
        s.bars_seen += 1;
        s.last_tick_ts = bar_close_ts;

        match s.phase {
            Phase::Idle => {
                s.phase = Phase::Evaluating;
                drop(s);
                self.evaluate(
                    features, prediction, regime, spread_bps, latency_ms, policy, bar_close_ts,
                    feature_cache, now_ns,
                )
            }
            Phase::Evaluating => {
                drop(s);
                self.evaluate(
                    features, prediction, regime, spread_bps, latency_ms, policy, bar_close_ts,
                    feature_cache, now_ns,
                )
            }
            Phase::InPosition => {
                let exit = Self::exit_condition(&s, prediction, policy, last_price, s.bars_seen, params.timeout_bars);
                if exit {
                    s.phase = Phase::Exiting;
                    info!(symbol = %self.symbol, "position exit condition met");
                }
                EvalOutcome {
                    candidate: None,
                    bar_close_ts,
                    exit_requested: exit,
                }
            }
            Phase::Exiting => EvalOutcome {
                candidate: None,
                bar_close_ts,
                exit_requested: false,
            },
            Phase::Cooldown => {
                if s.cooldown_bars_remaining > 0 {
                    s.cooldown_bars_remaining -= 1;
                }
                if s.cooldown_bars_remaining == 0 {
                    s.phase = Phase::Idle;
                }
                EvalOutcome {
                    candidate: None,
                    bar_close_ts,
                    exit_requested: false,
                }
            }
        }
    }

    /// Called by the engine manager once the exit order's fill has been
    /// acknowledged by the Paper Execution Engine.
    pub fn acknowledge_exit_fill(&self) {
        let mut s = self.state.write();
        s.position = None;
        s.phase = Phase::Cooldown;
        s.cooldown_bars_remaining = self.profile.params().cooldown_bars;
    }

    /// Called by the engine manager once an entry candidate was accepted by
    /// the Risk gate and filled.
    pub fn acknowledge_entry_fill(&self, side: Side, entry_price: f64, atr: f64) {
        let params = self.profile.params();
        let mut s = self.state.write();
        let (stop_loss, take_profit) = match side {
            Side::Buy => (
                entry_price - atr * params.sl_atr_mult,
                entry_price + atr * params.tp_atr_mult,
            ),
            _ => (
                entry_price + atr * params.sl_atr_mult,
                entry_price - atr * params.tp_atr_mult,
            ),
        };
        s.position = Some(OpenPosition {
            side,
            entry_price,
            stop_loss,
            take_profit,
            entry_bar: s.bars_seen,
        });
        s.phase = Phase::InPosition;
    }

    /// Candidate was rejected by Risk, or no entry condition fired this bar.
    pub fn back_to_idle(&self) {
        let mut s = self.state.write();
        if s.phase == Phase::Evaluating {
            s.phase = Phase::Idle;
        }
    }

    fn evaluate(
        &self,
        features: &FeatureVector,
        prediction: &Prediction,
        regime: MarketRegime,
        spread_bps: f64,
        latency_ms: u64,
        policy: ModelPolicy,
        bar_close_ts: i64,
        feature_cache: &FeatureCache,
        now_ns: i64,
    ) -> EvalOutcome {
        let params = self.profile.params();

        if !Self::filters_pass(features, spread_bps, latency_ms, &params, feature_cache, &self.symbol, now_ns) {
            return EvalOutcome {
                candidate: None,
                bar_close_ts,
                exit_requested: false,
            };
        }

        if params.use_adx_filter {
            if !matches!(regime, MarketRegime::Trending) {
                return EvalOutcome {
                    candidate: None,
                    bar_close_ts,
                    exit_requested: false,
                };
            }
        }

        let momentum_norm = momentum_gate_score(features);
        let macd_sign = macd_histogram_sign(&features.price_history);
        let rsi_gate_side = {
            let mut s = self.state.write();
            let side = rsi_macd_sync(&mut s.rsi_prev, features.rsi_14, macd_sign);
            side
        };

        let combined_buy = momentum_norm.max(prediction.prob_up);
        let combined_sell = (1.0 - momentum_norm).max(1.0 - prediction.prob_up);

        let side = if combined_buy >= policy.entry_threshold && rsi_gate_side != Some(Side::Sell) {
            Some(Side::Buy)
        } else if combined_sell >= policy.entry_threshold && rsi_gate_side != Some(Side::Buy) {
            Some(Side::Sell)
        } else {
            None
        };

        let Some(side) = side else {
            return EvalOutcome {
                candidate: None,
                bar_close_ts,
                exit_requested: false,
            };
        };

        let confidence = if side == Side::Buy { combined_buy } else { combined_sell };
        let vol_bps = features.volatility.unwrap_or(0.0).abs() * 10_000.0;
        let notional = sizing_notional(confidence, regime, vol_bps);

        let signal = Signal::new(self.symbol.clone(), side, confidence, notional, "strategy_engine");
        debug!(symbol = %self.symbol, side = %side, confidence, notional, "entry candidate produced");

        EvalOutcome {
            candidate: Some(signal),
            bar_close_ts,
            exit_requested: false,
        }
    }

    fn filters_pass(
        features: &FeatureVector,
        spread_bps: f64,
        latency_ms: u64,
        params: &ProfileParams,
        feature_cache: &FeatureCache,
        symbol: &Symbol,
        now_ns: i64,
    ) -> bool {
        if spread_bps > params.max_spread_bps {
            return false;
        }
        if latency_ms > params.max_latency_ms {
            return false;
        }
        let vol_bps = features.volatility.unwrap_or(0.0).abs() * 10_000.0;
        if vol_bps < params.min_vol_bps {
            return false;
        }
        if feature_cache.is_stale(symbol, now_ns) {
            return false;
        }
        true
    }

    fn exit_condition(
        s: &Inner,
        prediction: &Prediction,
        policy: ModelPolicy,
        last_price: f64,
        bars_seen: u64,
        timeout_bars: u32,
    ) -> bool {
        let Some(pos) = &s.position else { return false };

        let stop_hit = match pos.side {
            Side::Buy => last_price <= pos.stop_loss,
            Side::Sell => last_price >= pos.stop_loss,
            Side::Flat => false,
        };
        let take_hit = match pos.side {
            Side::Buy => last_price >= pos.take_profit,
            Side::Sell => last_price <= pos.take_profit,
            Side::Flat => false,
        };
        let timed_out = bars_seen.saturating_sub(pos.entry_bar) >= timeout_bars as u64;
        let reversal = match pos.side {
            Side::Buy => prediction.prob_up <= policy.exit_threshold,
            Side::Sell => prediction.prob_up >= policy.entry_threshold,
            Side::Flat => false,
        };

        stop_hit || take_hit || timed_out || reversal
    }
}

/// Weighted momentum score over returns_1/5/10, trend vs MA_20, RSI zone, and
/// volatility band, mapped into `[0, 1]` (1.0 = maximally bullish).
fn momentum_gate_score(features: &FeatureVector) -> f64 {
    let mut score = 0.0_f64;
    let mut weight_sum = 0.0_f64;

    let mut add = |weight: f64, direction: f64| {
        score += weight * direction;
        weight_sum += weight;
    };

    if let Some(r1) = features.returns_1 {
        add(0.15, r1.signum() * (r1.abs() * 50.0).min(1.0));
    }
    if let Some(r5) = features.returns_5 {
        add(0.20, r5.signum() * (r5.abs() * 20.0).min(1.0));
    }
    if let Some(r10) = features.returns_10 {
        add(0.15, r10.signum() * (r10.abs() * 10.0).min(1.0));
    }
    if let (Some(ma), Some(last)) = (features.ma_20, features.price_history.last()) {
        if ma > 0.0 {
            let trend = (last - ma) / ma;
            add(0.20, trend.signum() * (trend.abs() * 50.0).min(1.0));
        }
    }
    if let Some(rsi) = features.rsi_14 {
        let direction = if rsi > 55.0 {
            ((rsi - 50.0) / 50.0).min(1.0)
        } else if rsi < 45.0 {
            ((rsi - 50.0) / 50.0).max(-1.0)
        } else {
            0.0
        };
        add(0.20, direction);
    }
    if let Some(vol) = features.volatility {
        // Low volatility slightly favors continuation, high volatility is neutral.
        let direction = if vol.abs() < 0.01 { 0.2 } else { 0.0 };
        add(0.10, direction);
    }

    if weight_sum <= 0.0 {
        return 0.5;
    }
    ((score / weight_sum) + 1.0) / 2.0
}

/// Sign of the EMA(12) − EMA(26) histogram computed over the cached price
/// history — the closest substitute this corpus offers to a MACD histogram,
/// since the teacher has no dedicated MACD indicator.
fn macd_histogram_sign(price_history: &[f64]) -> f64 {
    if price_history.len() < 26 {
        return 0.0;
    }
    let ema_fast = calculate_ema(price_history, 12);
    let ema_slow = calculate_ema(price_history, 26);
    match (ema_fast.last(), ema_slow.last()) {
        (Some(f), Some(s)) => (f - s).signum(),
        _ => 0.0,
    }
}

/// RSI crossing 50 in the direction of the MACD histogram sign within the
/// profile's sync window. Returns the confirmed side, if any, and updates
/// `rsi_prev` for the next call.
fn rsi_macd_sync(rsi_prev: &mut Option<f64>, rsi_now: Option<f64>, macd_sign: f64) -> Option<Side> {
    let (prev, now) = match (*rsi_prev, rsi_now) {
        (Some(p), Some(n)) => (p, n),
        _ => {
            *rsi_prev = rsi_now;
            return None;
        }
    };
    *rsi_prev = rsi_now;

    let crossed_up = prev <= 50.0 && now > 50.0;
    let crossed_down = prev >= 50.0 && now < 50.0;

    if crossed_up && macd_sign > 0.0 {
        Some(Side::Buy)
    } else if crossed_down && macd_sign < 0.0 {
        Some(Side::Sell)
    } else {
        None
    }
}

fn regime_scaler(regime: MarketRegime) -> f64 {
    match regime {
        MarketRegime::Trending => 1.2,
        MarketRegime::Ranging => 0.8,
        MarketRegime::Squeeze => 0.9,
        MarketRegime::Volatile => 0.6,
        MarketRegime::Dead => 0.3,
    }
}

fn vol_scaler(vol_bps: f64) -> f64 {
    // Inverse-volatility sizing: scale down in choppy/high-vol conditions.
    if vol_bps <= 0.0 {
        1.0
    } else {
        (50.0 / vol_bps).clamp(0.3, 1.5)
    }
}

fn sizing_notional(confidence: f64, regime: MarketRegime, vol_bps: f64) -> f64 {
    const BASE_NOTIONAL_USD: f64 = 100.0;
    BASE_NOTIONAL_USD * confidence.clamp(0.0, 1.0) * regime_scaler(regime) * vol_scaler(vol_bps)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A `FeatureCache` with a single fresh tick recorded at `now_ns`, so
    /// `is_stale` reads `false` in tests exercising `on_bar`.
    fn fresh_feature_cache(symbol: &Symbol, now_ns: i64) -> FeatureCache {
        let cache = FeatureCache::new(60.0);
        cache.on_tick(symbol, 100.0, now_ns);
        cache
    }

    fn fv(symbol: &str) -> FeatureVector {
        FeatureVector {
            symbol: Symbol::new(symbol),
            computed_at: Utc::now(),
            window_size: 30,
            price_history: (0..30).map(|i| 100.0 + i as f64).collect(),
            returns_1: Some(0.02),
            returns_5: Some(0.05),
            returns_10: Some(0.08),
            ma_20: Some(100.0),
            rsi_14: Some(65.0),
            volatility: Some(0.01),
            z_score_60: None,
            atr_14: Some(1.5),
            staleness_seconds: 0.0,
        }
    }

    fn prediction(prob_up: f64) -> Prediction {
        Prediction {
            symbol: Symbol::new("BTCUSDT"),
            horizon: "60s".to_string(),
            prob_up,
            confidence: 0.7,
            model_name: "stub".to_string(),
            is_fallback: true,
            fallback_reason: None,
            staleness_seconds: 0.0,
            computed_at: Utc::now(),
            latency_ms: 10,
        }
    }

    #[test]
    fn idle_transitions_to_evaluating_and_may_produce_candidate() {
        let engine = StrategyEngine::new(Symbol::new("BTCUSDT"), StrategyProfile::Day);
        let cache = fresh_feature_cache(&engine.symbol, 1_000_000_000);
        let outcome = engine.on_bar(
            &fv("BTCUSDT"),
            &prediction(0.9),
            MarketRegime::Trending,
            1.0,
            50,
            ModelPolicy::default(),
            1,
            130.0,
            &cache,
            1_000_000_000,
        );
        assert!(outcome.candidate.is_some());
        assert_eq!(engine.phase(), Phase::Evaluating);
    }

    #[test]
    fn filters_block_entry_on_wide_spread() {
        let engine = StrategyEngine::new(Symbol::new("BTCUSDT"), StrategyProfile::Scalp);
        let cache = fresh_feature_cache(&engine.symbol, 1_000_000_000);
        let outcome = engine.on_bar(
            &fv("BTCUSDT"),
            &prediction(0.9),
            MarketRegime::Trending,
            50.0,
            50,
            ModelPolicy::default(),
            1,
            130.0,
            &cache,
            1_000_000_000,
        );
        assert!(outcome.candidate.is_none());
    }

    #[test]
    fn filters_block_entry_on_stale_features() {
        let engine = StrategyEngine::new(Symbol::new("BTCUSDT"), StrategyProfile::Day);
        // Cache never ticked for this symbol -> `is_stale` reads `true`.
        let cache = FeatureCache::new(60.0);
        let outcome = engine.on_bar(
            &fv("BTCUSDT"),
            &prediction(0.9),
            MarketRegime::Trending,
            1.0,
            50,
            ModelPolicy::default(),
            1,
            130.0,
            &cache,
            1_000_000_000,
        );
        assert!(outcome.candidate.is_none());
    }

    #[test]
    fn acknowledge_entry_fill_moves_to_in_position_and_sets_sl_tp() {
        let engine = StrategyEngine::new(Symbol::new("BTCUSDT"), StrategyProfile::Day);
        engine.acknowledge_entry_fill(Side::Buy, 100.0, 2.0);
        assert_eq!(engine.phase(), Phase::InPosition);
        let pos = engine.position().unwrap();
        assert!(pos.stop_loss < 100.0);
        assert!(pos.take_profit > 100.0);
    }

    #[test]
    fn stop_loss_hit_triggers_exit() {
        let engine = StrategyEngine::new(Symbol::new("BTCUSDT"), StrategyProfile::Day);
        let cache = fresh_feature_cache(&engine.symbol, 1_000_000_000);
        engine.acknowledge_entry_fill(Side::Buy, 100.0, 2.0);
        let outcome = engine.on_bar(
            &fv("BTCUSDT"),
            &prediction(0.5),
            MarketRegime::Trending,
            1.0,
            50,
            ModelPolicy::default(),
            1,
            90.0,
            &cache,
            1_000_000_000,
        );
        assert!(outcome.exit_requested);
        assert_eq!(engine.phase(), Phase::Exiting);
    }

    #[test]
    fn cooldown_counts_down_to_idle() {
        let engine = StrategyEngine::new(Symbol::new("BTCUSDT"), StrategyProfile::Scalp);
        let cache = fresh_feature_cache(&engine.symbol, 1_000_000_000);
        engine.acknowledge_exit_fill();
        assert_eq!(engine.phase(), Phase::Cooldown);
        for _ in 0..5 {
            engine.on_bar(
                &fv("BTCUSDT"),
                &prediction(0.5),
                MarketRegime::Ranging,
                1.0,
                50,
                ModelPolicy::default(),
                1,
                100.0,
                &cache,
                1_000_000_000,
            );
        }
        assert_eq!(engine.phase(), Phase::Idle);
    }

    #[test]
    fn sizing_notional_scales_with_confidence_and_regime() {
        let trending = sizing_notional(0.8, MarketRegime::Trending, 20.0);
        let dead = sizing_notional(0.8, MarketRegime::Dead, 20.0);
        assert!(trending > dead);
    }
}
