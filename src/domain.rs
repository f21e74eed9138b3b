// =============================================================================
// Core trading data model (§3): features, predictions, signals, guardrails,
// orders, fills, positions, trades, equity snapshots.
// =============================================================================

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::types::{Side, Symbol};

/// Per-symbol rolling derived features (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub symbol: Symbol,
    pub computed_at: DateTime<Utc>,
    pub window_size: usize,
    pub price_history: Vec<f64>,
    pub returns_1: Option<f64>,
    pub returns_5: Option<f64>,
    pub returns_10: Option<f64>,
    pub ma_20: Option<f64>,
    pub rsi_14: Option<f64>,
    pub volatility: Option<f64>,
    pub z_score_60: Option<f64>,
    pub atr_14: Option<f64>,
    pub staleness_seconds: f64,
}

/// A model's forecast for one symbol/horizon (§3, §4.5). Immutable once
/// produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub symbol: Symbol,
    pub horizon: String,
    pub prob_up: f64,
    pub confidence: f64,
    pub model_name: String,
    pub is_fallback: bool,
    pub fallback_reason: Option<String>,
    pub staleness_seconds: f64,
    pub computed_at: DateTime<Utc>,
    pub latency_ms: u64,
}

/// A candidate trade, produced by a Strategy Engine, subject to Risk (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Ulid,
    pub symbol: Symbol,
    pub side: Side,
    pub confidence: f64,
    pub intended_notional_usd: f64,
    pub source_strategy: String,
    pub created_at: DateTime<Utc>,
    pub prediction_ref: Option<String>,
}

impl Signal {
    pub fn new(
        symbol: Symbol,
        side: Side,
        confidence: f64,
        intended_notional_usd: f64,
        source_strategy: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            symbol,
            side,
            confidence,
            intended_notional_usd,
            source_strategy: source_strategy.into(),
            created_at: Utc::now(),
            prediction_ref: None,
        }
    }
}

/// Process-wide risk guardrails singleton (§3). Mutated only through
/// `RiskEngine::set_guardrails`, which audits every patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guardrails {
    pub confidence_threshold: f64,
    pub max_trade_usd: f64,
    pub max_daily_loss_usd: f64,
    pub cooldown_minutes: i64,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_latency_ms: u64,
    pub symbol_allowlist: HashSet<Symbol>,
    pub kill_switch: bool,
    pub cooldown_until_ts: Option<DateTime<Utc>>,
}

/// Patch applied via `POST /risk/guardrails`; any field left `None` is
/// unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardrailsPatch {
    pub confidence_threshold: Option<f64>,
    pub max_trade_usd: Option<f64>,
    pub max_daily_loss_usd: Option<f64>,
    pub cooldown_minutes: Option<i64>,
    pub circuit_breaker_enabled: Option<bool>,
    pub circuit_breaker_latency_ms: Option<u64>,
    pub symbol_allowlist: Option<HashSet<Symbol>>,
    pub kill_switch: Option<bool>,
}

/// A dispatched order (§3). `order_type` is always `market` for the paper
/// engine's scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Ulid,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub notional_usd: f64,
    pub requested_price: f64,
    pub order_type: OrderType,
    pub created_at: DateTime<Utc>,
    pub client_request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
}

/// The execution outcome of an Order (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Ulid,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub fill_price: f64,
    pub slippage_bps: f64,
    pub fee_usd: f64,
    pub filled_at: DateTime<Utc>,
}

/// Open or closed holding in one symbol (§3). Closed when quantity returns
/// to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity_signed: f64,
    pub average_entry_price: f64,
    pub unrealized_pnl_usd: f64,
    pub opened_at: DateTime<Utc>,
    pub last_mark_price: f64,
    pub last_mark_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: Symbol, now: DateTime<Utc>) -> Self {
        Self {
            symbol,
            quantity_signed: 0.0,
            average_entry_price: 0.0,
            unrealized_pnl_usd: 0.0,
            opened_at: now,
            last_mark_price: 0.0,
            last_mark_at: now,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity_signed.abs() < f64::EPSILON
    }
}

/// A completed round-trip (opening fill + closing fill), immutable (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub open_fill_ref: Ulid,
    pub close_fill_ref: Ulid,
    pub realized_pnl_usd: f64,
    pub rr_multiple: Option<f64>,
    pub closed_at: DateTime<Utc>,
}

/// Periodic account snapshot (§3), appended at most once per 10 s or on
/// every fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub ts: DateTime<Utc>,
    pub cash_balance: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl_to_date: f64,
    pub equity: f64,
    pub drawdown_pct: f64,
}

/// A point-in-time capture of all flags (§3, §4.10). Append-only; restorable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagsSnapshot {
    pub id: Ulid,
    pub taken_at: DateTime<Utc>,
    pub content: serde_json::Value,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_flat_detects_zero_quantity() {
        let pos = Position::flat(Symbol::new("BTCUSDT"), Utc::now());
        assert!(pos.is_flat());
    }

    #[test]
    fn signal_new_assigns_unique_ulid() {
        let s1 = Signal::new(Symbol::new("BTCUSDT"), Side::Buy, 0.7, 100.0, "momentum");
        let s2 = Signal::new(Symbol::new("BTCUSDT"), Side::Buy, 0.7, 100.0, "momentum");
        assert_ne!(s1.id, s2.id);
    }
}
