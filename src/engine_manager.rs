// =============================================================================
// Engine Manager (C7)
// =============================================================================
//
// Owns the set of running per-symbol Strategy Engines: start/stop/restart/
// batch operations, health observation, and auto-recovery. The teacher has no
// lifecycle manager of its own (`main.rs` just spawns flat `tokio::spawn`
// loops with a fixed 5s retry sleep and no restart policy); this is grounded
// on the teacher's own single-writer-map-with-snapshot-readers idiom
// (`PositionManager`, `RiskEngine`'s internal `RwLock`) for the engines map,
// and on the retrieval pack's resilience primitives
// (`guribe94-bog/bog-core/src/resilience/{backoff,kill_switch}.rs`) for the
// restart-with-backoff and atomic-state-flag shape, adapted to a per-engine
// `EngineState` instead of one process-wide kill switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::event_bus::EventBus;
use crate::feature_cache::FeatureCache;
use crate::model_provider::ModelProvider;
use crate::paper_execution::PaperExecutionEngine;
use crate::regime::MarketRegime;
use crate::risk::{EvaluateContext, RiskEngine};
use crate::strategy_engine::{StrategyEngine, StrategyProfile};
use crate::tick_store::TickStore;
use crate::types::{Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Failed,
    PermanentlyFailed,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Failed,
            _ => Self::PermanentlyFailed,
        }
    }
    fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Clone)]
pub struct EngineDeps {
    pub tick_store: Arc<TickStore>,
    pub feature_cache: Arc<FeatureCache>,
    pub model_provider: Arc<ModelProvider>,
    pub risk: Arc<RiskEngine>,
    pub paper: Arc<PaperExecutionEngine>,
    pub event_bus: Arc<EventBus>,
    pub regimes: Arc<RwLock<HashMap<Symbol, MarketRegime>>>,
    pub risk_min_notional: f64,
    pub risk_max_notional: f64,
}

struct EngineHandle {
    strategy: Arc<StrategyEngine>,
    profile: StrategyProfile,
    state: Arc<AtomicU8>,
    cancel: Arc<AtomicBool>,
    started_at: Instant,
    heartbeat_ts: Arc<RwLock<i64>>,
    restart_attempts: Arc<AtomicU32>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub symbol: String,
    pub state: EngineState,
    pub mode: String,
    pub uptime_s: u64,
    pub heartbeat_ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Start,
    Stop,
}

pub struct EngineManager {
    engines: RwLock<HashMap<Symbol, EngineHandle>>,
    deps: Arc<EngineDeps>,
}

impl EngineManager {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            deps: Arc::new(deps),
        }
    }

    /// Idempotent: if already running with the same mode, returns the
    /// current handle without restarting it.
    pub fn start(&self, symbol: Symbol, profile: StrategyProfile) -> EngineSummary {
        {
            let engines = self.engines.read();
            if let Some(existing) = engines.get(&symbol) {
                if existing.profile == profile
                    && EngineState::from_u8(existing.state.load(Ordering::Relaxed)) == EngineState::Running
                {
                    return Self::summarize(&symbol, existing);
                }
            }
        }

        let strategy = Arc::new(StrategyEngine::new(symbol.clone(), profile));
        let state = Arc::new(AtomicU8::new(EngineState::Running.as_u8()));
        let cancel = Arc::new(AtomicBool::new(false));
        let heartbeat_ts = Arc::new(RwLock::new(Utc::now().timestamp()));
        let restart_attempts = Arc::new(AtomicU32::new(0));

        let task = spawn_engine_task(
            symbol.clone(),
            strategy.clone(),
            self.deps.clone(),
            cancel.clone(),
            state.clone(),
            heartbeat_ts.clone(),
        );

        let handle = EngineHandle {
            strategy,
            profile,
            state,
            cancel,
            started_at: Instant::now(),
            heartbeat_ts,
            restart_attempts,
            task: Some(task),
        };
        let summary = Self::summarize(&symbol, &handle);
        self.engines.write().insert(symbol, handle);
        summary
    }

    /// Graceful by default: the task observes `cancel` at its next bar
    /// boundary. `force=true` additionally aborts the task immediately.
    pub fn stop(&self, symbol: &Symbol, force: bool) -> bool {
        let mut engines = self.engines.write();
        let Some(handle) = engines.get_mut(symbol) else {
            return false;
        };
        handle.cancel.store(true, Ordering::Relaxed);
        handle.state.store(EngineState::Idle.as_u8(), Ordering::Relaxed);
        if force {
            if let Some(task) = handle.task.take() {
                task.abort();
            }
        }
        info!(symbol = %symbol, force, "engine stop requested");
        true
    }

    /// Scans for engines whose state is `Failed` or whose heartbeat has gone
    /// stale beyond `heartbeat_gap_s`, and restarts them with exponential
    /// backoff (1s -> 60s, 5 attempts) before marking `PermanentlyFailed`.
    pub async fn restart_failed(&self, heartbeat_gap_s: u64) -> Vec<Symbol> {
        let now = Utc::now().timestamp();
        let stale: Vec<(Symbol, StrategyProfile)> = {
            let engines = self.engines.read();
            engines
                .iter()
                .filter(|(_, h)| {
                    let state = EngineState::from_u8(h.state.load(Ordering::Relaxed));
                    let gap = now - *h.heartbeat_ts.read();
                    state == EngineState::Failed || (state == EngineState::Running && gap > heartbeat_gap_s as i64)
                })
                .map(|(sym, h)| (sym.clone(), h.profile))
                .collect()
        };

        let mut restarted = Vec::new();
        for (symbol, profile) in stale {
            let attempts = {
                let engines = self.engines.read();
                engines
                    .get(&symbol)
                    .map(|h| h.restart_attempts.load(Ordering::Relaxed))
                    .unwrap_or(0)
            };

            let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
                max_retries: Some(5),
                max_delay: std::time::Duration::from_secs(60),
                ..BackoffConfig::default()
            });
            for _ in 0..attempts {
                backoff.next_delay();
            }

            let Some(delay) = backoff.next_delay() else {
                if let Some(h) = self.engines.write().get_mut(&symbol) {
                    h.state.store(EngineState::PermanentlyFailed.as_u8(), Ordering::Relaxed);
                }
                self.deps.event_bus.publish(
                    "events",
                    serde_json::json!({"kind": "EngineAlert", "symbol": symbol.to_string(), "reason": "permanently_failed"}),
                );
                warn!(symbol = %symbol, "engine permanently failed after 5 restart attempts");
                continue;
            };

            warn!(symbol = %symbol, attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "restarting engine after backoff");
            tokio::time::sleep(delay).await;
            {
                let mut engines = self.engines.write();
                if let Some(h) = engines.get_mut(&symbol) {
                    if let Some(task) = h.task.take() {
                        task.abort();
                    }
                    h.restart_attempts.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.start(symbol.clone(), profile);
            restarted.push(symbol);
        }
        restarted
    }

    pub fn batch(&self, symbols: Vec<Symbol>, action: BatchAction, profile: StrategyProfile) -> Vec<(String, bool)> {
        symbols
            .into_iter()
            .map(|symbol| {
                let ok = match action {
                    BatchAction::Start => {
                        self.start(symbol.clone(), profile);
                        true
                    }
                    BatchAction::Stop => self.stop(&symbol, false),
                };
                (symbol.to_string(), ok)
            })
            .collect()
    }

    pub fn list(&self) -> Vec<EngineSummary> {
        self.engines
            .read()
            .iter()
            .map(|(symbol, handle)| Self::summarize(symbol, handle))
            .collect()
    }

    fn summarize(symbol: &Symbol, handle: &EngineHandle) -> EngineSummary {
        EngineSummary {
            symbol: symbol.to_string(),
            state: EngineState::from_u8(handle.state.load(Ordering::Relaxed)),
            mode: format!("{:?}", handle.profile),
            uptime_s: handle.started_at.elapsed().as_secs(),
            heartbeat_ts: *handle.heartbeat_ts.read(),
        }
    }
}

/// Supervisor: runs `engine_loop` on its own task and watches its
/// `JoinHandle` so a panic inside the evaluation loop (scenario 6, spec §8)
/// is observed here rather than leaving `state` stuck at `Running`.
fn spawn_engine_task(
    symbol: Symbol,
    strategy: Arc<StrategyEngine>,
    deps: Arc<EngineDeps>,
    cancel: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    heartbeat_ts: Arc<RwLock<i64>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let inner_state = state.clone();
        let inner = tokio::spawn(engine_loop(
            symbol.clone(),
            strategy,
            deps,
            cancel,
            inner_state,
            heartbeat_ts,
        ));

        match inner.await {
            Ok(()) => {}
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "engine evaluation loop panicked");
                state.store(EngineState::Failed.as_u8(), Ordering::Relaxed);
            }
        }
    })
}

async fn engine_loop(
    symbol: Symbol,
    strategy: Arc<StrategyEngine>,
    deps: Arc<EngineDeps>,
    cancel: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    heartbeat_ts: Arc<RwLock<i64>>,
) {
    let params = strategy.profile.params();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(params.bar_interval_s.max(1)));

    loop {
        interval.tick().await;
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let now = Utc::now();
        let now_ns = now.timestamp_nanos_opt().unwrap_or(0);
        *heartbeat_ts.write() = now.timestamp();

        let Some(tick) = deps.event_bus.get_last_tick(&symbol) else {
            continue;
        };
        let features = deps.feature_cache.compute(&symbol, now_ns);
        let Some(features) = features else { continue };

        let regime = deps
            .regimes
            .read()
            .get(&symbol)
            .copied()
            .unwrap_or(MarketRegime::Ranging);

        let prediction = deps.model_provider.predict(&symbol, "60s", Some(&features)).await;
        let policy = deps.model_provider.policy();

        let spread_bps = match (tick.bid, tick.ask) {
            (Some(b), Some(a)) if b > 0.0 => ((a - b) / b) * 10_000.0,
            _ => 0.0,
        };
        let latency_ms = ((now_ns - tick.timestamp_ns).max(0) / 1_000_000) as u64;

        let outcome = strategy.on_bar(
            &features,
            &prediction,
            regime,
            spread_bps,
            latency_ms,
            policy,
            now.timestamp(),
            tick.last_price,
            &deps.feature_cache,
            now_ns,
        );

        if outcome.exit_requested {
            if let Some(pos) = strategy.position() {
                let exit_side = match pos.side {
                    Side::Buy => Side::Sell,
                    Side::Sell => Side::Buy,
                    Side::Flat => Side::Flat,
                };
                let notional = pos.entry_price.abs() * 1.0;
                let client_request_id = format!("{symbol}-exit-{}", now.timestamp_nanos_opt().unwrap_or(0));
                match deps
                    .paper
                    .submit_order(symbol.clone(), exit_side, notional, client_request_id, now_ns)
                {
                    Ok(_) => strategy.acknowledge_exit_fill(),
                    Err(e) => warn!(symbol = %symbol, error = %e, "exit order failed"),
                }
            }
            continue;
        }

        let Some(candidate) = outcome.candidate else {
            strategy.back_to_idle();
            continue;
        };

        let ctx = EvaluateContext {
            unrealized_pnl: 0.0,
            prediction_latency_ms: Some(prediction.latency_ms),
            bar_close_ts: outcome.bar_close_ts,
        };

        match deps
            .risk
            .evaluate(candidate, &ctx, deps.risk_min_notional, deps.risk_max_notional)
        {
            Ok(accepted) => {
                let client_request_id = accepted
                    .prediction_ref
                    .clone()
                    .unwrap_or_else(|| format!("{symbol}-{}", now_ns));
                match deps.paper.submit_order(
                    symbol.clone(),
                    accepted.side,
                    accepted.intended_notional_usd,
                    client_request_id,
                    now_ns,
                ) {
                    Ok(fill) => {
                        let atr = features.atr_14.unwrap_or(fill.fill_price * 0.01);
                        strategy.acknowledge_entry_fill(accepted.side, fill.fill_price, atr);
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "entry order failed");
                        strategy.back_to_idle();
                    }
                }
            }
            Err(reason) => {
                deps.event_bus.publish(
                    "signals",
                    serde_json::json!({"kind": "SignalRejected", "symbol": symbol.to_string(), "reason": reason.as_str()}),
                );
                strategy.back_to_idle();
            }
        }
    }

    state.store(EngineState::Idle.as_u8(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;

    fn deps() -> EngineDeps {
        let tick_store = Arc::new(TickStore::new(crate::tick_store::TickStoreConfig::default()));
        let event_bus = Arc::new(EventBus::new());
        EngineDeps {
            tick_store: tick_store.clone(),
            feature_cache: Arc::new(FeatureCache::new(60.0)),
            model_provider: Arc::new(ModelProvider::new(
                std::time::Duration::from_millis(500),
                60.0,
                event_bus.clone(),
            )),
            risk: Arc::new(RiskEngine::new(Arc::new(AuditLog::new()), "UTC")),
            paper: Arc::new(PaperExecutionEngine::new(
                crate::paper_execution::PaperExecutionConfig {
                    starting_cash: 10_000.0,
                    slippage_bps: 2.0,
                    fee_taker_bps: 5.0,
                    fee_maker_bps: 2.0,
                    freshness_window_s: 60.0,
                },
                tick_store,
                event_bus.clone(),
            )),
            event_bus,
            regimes: Arc::new(RwLock::new(HashMap::new())),
            risk_min_notional: 5.0,
            risk_max_notional: 250.0,
        }
    }

    #[test]
    fn start_is_idempotent_for_same_profile() {
        let manager = EngineManager::new(deps());
        let sym = Symbol::new("BTCUSDT");
        let s1 = manager.start(sym.clone(), StrategyProfile::Day);
        let s2 = manager.start(sym.clone(), StrategyProfile::Day);
        assert_eq!(s1.symbol, s2.symbol);
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn stop_marks_engine_idle() {
        let manager = EngineManager::new(deps());
        let sym = Symbol::new("ETHUSDT");
        manager.start(sym.clone(), StrategyProfile::Scalp);
        assert!(manager.stop(&sym, false));
        let summary = manager.list().into_iter().find(|e| e.symbol == "ETHUSDT").unwrap();
        assert_eq!(summary.state, EngineState::Idle);
    }

    #[test]
    fn batch_start_reports_per_symbol_result() {
        let manager = EngineManager::new(deps());
        let results = manager.batch(
            vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")],
            BatchAction::Start,
            StrategyProfile::Day,
        );
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, ok)| *ok));
    }

    #[tokio::test]
    async fn restart_failed_is_noop_when_nothing_is_stale() {
        let manager = EngineManager::new(deps());
        manager.start(Symbol::new("BTCUSDT"), StrategyProfile::Day);
        let restarted = manager.restart_failed(60).await;
        assert!(restarted.is_empty());
    }
}
