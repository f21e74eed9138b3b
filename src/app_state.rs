// =============================================================================
// Central Application State — wires together C1-C10
// =============================================================================
//
// Replaces the teacher's flatter `AppState` (one `Arc`/`RwLock` field per
// market-data/risk/position/signal subsystem) with the component set this
// core is built from. Kept from the teacher: the `Arc<RwLock<...>>`-per-
// subsystem shape, the `build_snapshot()` method feeding both the REST
// dashboard endpoint and the WebSocket push feed, and `FlagsStore`'s reuse of
// `RuntimeConfig`'s atomic tmp+rename persistence as its payload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::CoreConfig;
use crate::domain::{EquitySnapshot, Position, Trade};
use crate::engine_manager::{EngineDeps, EngineManager, EngineSummary};
use crate::event_bus::{EventBus, TOPIC_EVENTS};
use crate::feature_cache::FeatureCache;
use crate::flags_store::FlagsStore;
use crate::market_data::Candle;
use crate::market_feed::{FeedState, MarketFeed};
use crate::model_provider::{ActiveModel, ModelProvider};
use crate::paper_execution::{PaperExecutionConfig, PaperExecutionEngine};
use crate::regime::{MarketRegime, RegimeDetector};
use crate::risk::{GuardrailsState, RiskEngine};
use crate::tick_store::{Granularity, TickStore, TickStoreConfig};
use crate::types::Symbol;

const FLAGS_PATH: &str = "runtime_config.json";
const REGIME_CANDLE_WINDOW: i64 = 120;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: CoreConfig,
    pub start_time: Instant,

    pub tick_store: Arc<TickStore>,
    pub event_bus: Arc<EventBus>,
    pub feature_cache: Arc<FeatureCache>,
    pub model_provider: Arc<ModelProvider>,
    pub risk: Arc<RiskEngine>,
    pub paper: Arc<PaperExecutionEngine>,
    pub audit: Arc<AuditLog>,
    pub flags: Arc<FlagsStore>,
    pub engines: Arc<EngineManager>,
    pub market_feed: Arc<MarketFeed>,

    /// Shared by the regime loop (writer) and every running Strategy Engine
    /// task (reader, via `EngineDeps::regimes`).
    pub regimes: Arc<RwLock<HashMap<Symbol, MarketRegime>>>,
    regime_detectors: RwLock<HashMap<Symbol, Arc<RegimeDetector>>>,
}

impl AppState {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        let symbols: Vec<Symbol> = config.symbols.iter().map(Symbol::new).collect();

        let tick_store = Arc::new(TickStore::new(TickStoreConfig {
            freshness_window_s: config.feature_staleness_s.max(60.0),
            ..TickStoreConfig::default()
        }));
        let event_bus = Arc::new(EventBus::with_capacity(config.stream_maxlen));
        let feature_cache = Arc::new(FeatureCache::new(config.feature_staleness_s));
        let model_provider = Arc::new(ModelProvider::new(
            config.model_timeout(),
            config.feature_staleness_s,
            event_bus.clone(),
        ));
        let audit = Arc::new(AuditLog::new());

        let risk = Arc::new(
            RiskEngine::new(audit.clone(), config.local_midnight_tz.clone())
                .with_allowlist(symbols.clone())
                .with_limits(config.risk_min_notional, config.risk_max_notional),
        );

        let paper = Arc::new(PaperExecutionEngine::new(
            PaperExecutionConfig {
                starting_cash: 10_000.0,
                slippage_bps: config.slippage_bps,
                fee_taker_bps: config.fee_taker_bps,
                fee_maker_bps: config.fee_maker_bps,
                freshness_window_s: config.feature_staleness_s.max(60.0),
            },
            tick_store.clone(),
            event_bus.clone(),
        ));

        let flags = Arc::new(FlagsStore::new(FLAGS_PATH, audit.clone(), event_bus.clone()));

        let regimes = Arc::new(RwLock::new(HashMap::new()));

        let engine_deps = EngineDeps {
            tick_store: tick_store.clone(),
            feature_cache: feature_cache.clone(),
            model_provider: model_provider.clone(),
            risk: risk.clone(),
            paper: paper.clone(),
            event_bus: event_bus.clone(),
            regimes: regimes.clone(),
            risk_min_notional: config.risk_min_notional,
            risk_max_notional: config.risk_max_notional,
        };
        let engines = Arc::new(EngineManager::new(engine_deps));

        let market_feed = Arc::new(MarketFeed::new(
            config.exchange_ws_url.clone(),
            symbols.clone(),
            tick_store.clone(),
            feature_cache.clone(),
            event_bus.clone(),
            config.heartbeat_interval_s,
            config.heartbeat_gap_s,
        ));

        let regime_detectors = RwLock::new(
            symbols
                .iter()
                .map(|s| (s.clone(), RegimeDetector::new()))
                .collect(),
        );

        Arc::new(Self {
            config,
            start_time: Instant::now(),
            tick_store,
            event_bus,
            feature_cache,
            model_provider,
            risk,
            paper,
            audit,
            flags,
            engines,
            market_feed,
            regimes,
            regime_detectors,
        })
    }

    /// Re-detect the market regime for every symbol from the tick store's
    /// 1-minute rollup, writing the result into the shared map every running
    /// Strategy Engine reads from. Runs on its own interval, independent of
    /// any single engine's bar cadence, since regimes change far slower than
    /// a Scalp profile's 1s bars.
    pub async fn run_regime_loop(self: Arc<Self>, shutdown: Arc<std::sync::atomic::AtomicBool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            interval.tick().await;
            let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
            let symbols: Vec<Symbol> = self.regime_detectors.read().keys().cloned().collect();

            for symbol in symbols {
                let bars = self.tick_store.window(
                    &symbol,
                    now_ns - REGIME_CANDLE_WINDOW * 60 * 1_000_000_000,
                    now_ns,
                    Granularity::M1,
                );
                if bars.len() < 50 {
                    continue;
                }
                let candles: Vec<Candle> = bars
                    .iter()
                    .map(|b| Candle {
                        open_time: b.bucket_start / 1_000_000,
                        close_time: (b.bucket_start + 60_000_000_000) / 1_000_000,
                        open: b.open,
                        high: b.high,
                        low: b.low,
                        close: b.close,
                        volume: b.volume,
                        quote_volume: b.volume * b.close,
                        trades_count: 0,
                        taker_buy_volume: 0.0,
                        taker_buy_quote_volume: 0.0,
                        is_closed: true,
                    })
                    .collect();

                if let Some(last) = candles.last() {
                    self.feature_cache.on_bar(&symbol, last.clone());
                }

                let detector = {
                    let detectors = self.regime_detectors.read();
                    detectors.get(&symbol).cloned()
                };
                let Some(detector) = detector else { continue };
                if let Some(state) = detector.update(&candles) {
                    self.regimes.write().insert(symbol.clone(), state.regime);
                    self.event_bus.publish(
                        TOPIC_EVENTS,
                        serde_json::json!({"kind": "RegimeChanged", "symbol": symbol.to_string(), "regime": state.regime.to_string()}),
                    );
                }
            }
        }
    }

    pub fn guardrails(&self) -> GuardrailsState {
        self.risk.snapshot()
    }

    pub fn engines_summary(&self) -> Vec<EngineSummary> {
        self.engines.list()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.paper.positions()
    }

    pub fn trades(&self, limit: usize) -> Vec<Trade> {
        self.paper.trades(limit)
    }

    pub fn equity(&self) -> Option<EquitySnapshot> {
        self.paper.latest_equity()
    }

    pub fn active_model(&self) -> ActiveModel {
        self.model_provider.active()
    }

    pub fn recent_audit(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.recent(limit)
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        StateSnapshot {
            server_time: now.timestamp_millis(),
            uptime_s: self.start_time.elapsed().as_secs(),
            feed_state: self.market_feed.state(),
            active_model: self.active_model(),
            guardrails: self.guardrails(),
            engines: self.engines_summary(),
            positions: self.positions(),
            recent_trades: self.trades(50),
            equity: self.equity(),
            regimes: self
                .regimes
                .read()
                .iter()
                .map(|(s, r)| (s.to_string(), r.to_string()))
                .collect(),
            recent_audit: self.recent_audit(50),
        }
    }
}

/// Full engine state snapshot sent to the dashboard REST endpoint and the
/// WebSocket push feed.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub server_time: i64,
    pub uptime_s: u64,
    pub feed_state: FeedState,
    pub active_model: ActiveModel,
    pub guardrails: GuardrailsState,
    pub engines: Vec<EngineSummary>,
    pub positions: Vec<Position>,
    pub recent_trades: Vec<Trade>,
    pub equity: Option<EquitySnapshot>,
    pub regimes: HashMap<String, String>,
    pub recent_audit: Vec<AuditEntry>,
}
