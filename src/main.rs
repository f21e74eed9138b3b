// =============================================================================
// Trading Core — Main Entry Point
// =============================================================================
//
// Boots every component (C1-C10), starts one Engine Manager task per
// configured symbol under the Day profile, and serves the HTTP/WS surface.
// Exit codes follow spec §6: 0 normal, 2 fatal startup failure, 130 on SIGINT.
// =============================================================================

mod api;
mod app_state;
mod audit;
mod backoff;
mod binance;
mod config;
mod domain;
mod engine_manager;
mod errors;
mod event_bus;
mod feature_cache;
mod flags_store;
mod indicators;
mod market_data;
mod market_feed;
mod model_provider;
mod paper_execution;
mod reconcile;
mod regime;
mod risk;
mod runtime_config;
mod strategy_engine;
mod tick_store;
mod types;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::CoreConfig;
use crate::event_bus::TOPIC_TICKS;
use crate::strategy_engine::StrategyProfile;
use crate::tick_store::Tick;
use crate::types::Symbol;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("trading-core starting up");

    let config = CoreConfig::from_env();
    if config.symbols.is_empty() {
        error!("no symbols configured — refusing to start");
        return ExitCode::from(2);
    }

    info!(symbols = ?config.symbols, ws_url = %config.exchange_ws_url, "configuration loaded");

    let state = AppState::new(config);
    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Market Feed (C3): ingest ticks, publish to TOPIC_TICKS ────────────
    {
        let feed = state.market_feed.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            feed.run(shutdown).await;
        });
    }

    // ── Regime loop (ambient, feeds Strategy Engine via `state.regimes`) ───
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            state.run_regime_loop(shutdown).await;
        });
    }

    // ── Mark-to-market subscriber: every tick updates open-position P&L ────
    {
        let paper = state.paper.clone();
        let mut rx = state.event_bus.subscribe(TOPIC_TICKS, Some("mark_to_market"));
        let event_bus = state.event_bus.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(tick) = serde_json::from_value::<Tick>(event.payload) {
                            paper.mark_to_market(&tick.symbol, tick.last_price);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        event_bus.record_drop(TOPIC_TICKS, "mark_to_market", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ── Engine Manager (C7): one per-symbol task, restarted on failure ─────
    for symbol in &state.config.symbols {
        let summary = state.engines.start(Symbol::new(symbol), StrategyProfile::Day);
        info!(symbol = %summary.symbol, state = ?summary.state, "engine started");
    }

    {
        let engines = state.engines.clone();
        let heartbeat_gap_s = state.config.heartbeat_gap_s;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
            while !shutdown.load(Ordering::Relaxed) {
                interval.tick().await;
                let restarted = engines.restart_failed(heartbeat_gap_s).await;
                if !restarted.is_empty() {
                    warn!(symbols = ?restarted, "engines restarted after heartbeat gap");
                }
            }
        });
    }

    // ── Reconciliation loop (live mode only; skipped without exchange keys) ─
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if !api_key.is_empty() && !api_secret.is_empty() {
        let client = Arc::new(binance::client::BinanceClient::new(api_key, api_secret));
        let paper = state.paper.clone();
        let balances = Arc::new(RwLock::new(Vec::new()));
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            while !shutdown.load(Ordering::Relaxed) {
                interval.tick().await;
                if let Err(e) = reconcile::reconcile_once(&client, &paper, &balances).await {
                    warn!(error = %e, "reconciliation cycle failed");
                }
            }
        });
        info!("reconciliation loop enabled (live exchange credentials present)");
    } else {
        info!("no exchange credentials configured — reconciliation loop disabled");
    }

    // ── HTTP/WS surface ──────────────────────────────────────────────────
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let app = api::rest::router(state.clone());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind HTTP listener");
            return ExitCode::from(2);
        }
    };
    info!(addr = %bind_addr, "HTTP/WS surface listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server exited with error");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install Ctrl+C handler");
        return ExitCode::from(2);
    }
    warn!("shutdown signal received — stopping gracefully");
    shutdown.store(true, Ordering::Relaxed);
    server.abort();

    info!("trading-core shut down complete");
    ExitCode::from(130)
}
