// =============================================================================
// Risk & Guardrails (C8) — the pre-trade gate
// =============================================================================
//
// Every Signal a Strategy Engine produces passes through `evaluate`, an
// ordered sequence of checks where the first failure short-circuits (§4.8).
// Keeps the teacher's `RwLock<Inner>` + date-rollover-on-read shape from the
// original `RiskEngine` (`maybe_reset_daily`, double-checked after acquiring
// the write lock) but reorders the checks to the spec's exact gate sequence
// and adds the `Guardrails` singleton, audited mutation API, and cooldown
// bookkeeping the teacher's four-circuit-breaker design did not have.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audit::AuditLog;
use crate::domain::{Guardrails, GuardrailsPatch, Signal};
use crate::types::Symbol;

/// Which trigger last set `cooldown_until_ts` — distinguishes the
/// daily-loss breaker (cleared by the daily reset) from an operator-driven
/// `trigger_cooldown` (left alone across the reset boundary, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownCause {
    DailyLoss,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Killed,
    SymbolNotAllowed,
    CooldownActive,
    LowConfidence,
    DailyLossLimit,
    CircuitBreakerLatency,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Killed => "killed",
            Self::SymbolNotAllowed => "symbol_not_allowed",
            Self::CooldownActive => "cooldown_active",
            Self::LowConfidence => "low_confidence",
            Self::DailyLossLimit => "daily_loss_limit",
            Self::CircuitBreakerLatency => "circuit_breaker_latency",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardrailsState {
    #[serde(flatten)]
    pub guardrails: Guardrails,
    pub cooldown_active: bool,
    pub cooldown_seconds_left: f64,
}

struct Inner {
    guardrails: Guardrails,
    realized_pnl_today: f64,
    current_date: String,
    circuit_breaker_fallback_remaining: u32,
    cooldown_cause: Option<CooldownCause>,
}

/// Inputs an evaluation needs beyond the signal itself: the book-keeping the
/// Strategy Engine/Paper Engine own.
pub struct EvaluateContext {
    pub unrealized_pnl: f64,
    pub prediction_latency_ms: Option<u64>,
    pub bar_close_ts: i64,
}

pub struct RiskEngine {
    state: RwLock<Inner>,
    audit: Arc<AuditLog>,
    local_midnight_tz: String,
}

impl RiskEngine {
    pub fn new(audit: Arc<AuditLog>, local_midnight_tz: impl Into<String>) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self {
            state: RwLock::new(Inner {
                guardrails: Guardrails {
                    confidence_threshold: 0.55,
                    max_trade_usd: 250.0,
                    max_daily_loss_usd: -200.0,
                    cooldown_minutes: 30,
                    circuit_breaker_enabled: true,
                    circuit_breaker_latency_ms: 1500,
                    symbol_allowlist: std::collections::HashSet::new(),
                    kill_switch: false,
                    cooldown_until_ts: None,
                },
                realized_pnl_today: 0.0,
                current_date: today,
                circuit_breaker_fallback_remaining: 0,
                cooldown_cause: None,
            }),
            audit,
            local_midnight_tz: local_midnight_tz.into(),
        }
    }

    pub fn with_allowlist(self, symbols: impl IntoIterator<Item = Symbol>) -> Self {
        self.state.write().guardrails.symbol_allowlist = symbols.into_iter().collect();
        self
    }

    pub fn with_limits(self, min_notional: f64, max_notional: f64) -> Self {
        {
            let mut s = self.state.write();
            s.guardrails.max_trade_usd = s.guardrails.max_trade_usd.clamp(min_notional, max_notional);
        }
        self
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// The 8-step ordered gate (§4.8). Mutates `signal.intended_notional_usd`
    /// in place on step 5 even when the overall result is an accept; returns
    /// the (possibly clamped) signal on success.
    pub fn evaluate(
        &self,
        mut signal: Signal,
        ctx: &EvaluateContext,
        risk_min_notional: f64,
        risk_max_notional: f64,
    ) -> Result<Signal, RejectReason> {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        // 1. Kill switch
        if s.guardrails.kill_switch {
            self.reject(&s, RejectReason::Killed, &signal);
            return Err(RejectReason::Killed);
        }

        // 2. Allowlist
        if !s.guardrails.symbol_allowlist.is_empty()
            && !s.guardrails.symbol_allowlist.contains(&signal.symbol)
        {
            self.reject(&s, RejectReason::SymbolNotAllowed, &signal);
            return Err(RejectReason::SymbolNotAllowed);
        }

        // 3. Cooldown
        let now = Utc::now();
        if let Some(until) = s.guardrails.cooldown_until_ts {
            if now < until {
                self.reject(&s, RejectReason::CooldownActive, &signal);
                return Err(RejectReason::CooldownActive);
            }
        }

        // 4. Confidence
        if signal.confidence < s.guardrails.confidence_threshold {
            self.reject(&s, RejectReason::LowConfidence, &signal);
            return Err(RejectReason::LowConfidence);
        }

        // 5. Notional clamp — never rejects, only mutates.
        let cap = risk_max_notional.min(s.guardrails.max_trade_usd);
        signal.intended_notional_usd = signal.intended_notional_usd.clamp(risk_min_notional, cap);

        // 6. Daily loss
        let total_pnl = s.realized_pnl_today + ctx.unrealized_pnl;
        if total_pnl <= s.guardrails.max_daily_loss_usd {
            let cooldown_until = now + chrono::Duration::minutes(s.guardrails.cooldown_minutes);
            s.guardrails.cooldown_until_ts = Some(cooldown_until);
            s.cooldown_cause = Some(CooldownCause::DailyLoss);
            warn!(total_pnl, limit = s.guardrails.max_daily_loss_usd, "daily loss breaker tripped");
            self.reject(&s, RejectReason::DailyLossLimit, &signal);
            return Err(RejectReason::DailyLossLimit);
        }

        // 7. Circuit breaker
        if s.guardrails.circuit_breaker_enabled {
            if let Some(latency) = ctx.prediction_latency_ms {
                if latency >= s.guardrails.circuit_breaker_latency_ms {
                    s.circuit_breaker_fallback_remaining = 5;
                    warn!(latency, "circuit breaker tripped on prediction latency");
                    self.reject(&s, RejectReason::CircuitBreakerLatency, &signal);
                    return Err(RejectReason::CircuitBreakerLatency);
                }
            }
        }

        // 8. Idempotency key for the downstream executor.
        signal.prediction_ref = Some(self.client_request_id(&signal, ctx.bar_close_ts));

        Ok(signal)
    }

    fn reject(&self, s: &Inner, reason: RejectReason, signal: &Signal) {
        let _ = s;
        self.audit.record(
            "risk_engine",
            format!("signal.reject.{}", reason.as_str()),
            Some(serde_json::json!({"symbol": signal.symbol, "side": signal.side})),
            None,
        );
    }

    fn client_request_id(&self, signal: &Signal, bar_close_ts: i64) -> String {
        let mut hasher = DefaultHasher::new();
        signal.symbol.as_str().hash(&mut hasher);
        format!("{:?}", signal.side).hash(&mut hasher);
        bar_close_ts.hash(&mut hasher);
        signal.source_strategy.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Whether the circuit breaker should force a fallback prediction for the
    /// next N predictions (decremented on each call).
    pub fn take_circuit_breaker_fallback(&self) -> bool {
        let mut s = self.state.write();
        if s.circuit_breaker_fallback_remaining > 0 {
            s.circuit_breaker_fallback_remaining -= 1;
            true
        } else {
            false
        }
    }

    // -------------------------------------------------------------------------
    // Mutation API
    // -------------------------------------------------------------------------

    pub fn set_guardrails(&self, patch: GuardrailsPatch, actor: &str) {
        let mut s = self.state.write();
        let before = serde_json::to_value(&s.guardrails).ok();

        if let Some(v) = patch.confidence_threshold {
            s.guardrails.confidence_threshold = v;
        }
        if let Some(v) = patch.max_trade_usd {
            s.guardrails.max_trade_usd = v;
        }
        if let Some(v) = patch.max_daily_loss_usd {
            s.guardrails.max_daily_loss_usd = v;
        }
        if let Some(v) = patch.cooldown_minutes {
            s.guardrails.cooldown_minutes = v;
        }
        if let Some(v) = patch.circuit_breaker_enabled {
            s.guardrails.circuit_breaker_enabled = v;
        }
        if let Some(v) = patch.circuit_breaker_latency_ms {
            s.guardrails.circuit_breaker_latency_ms = v;
        }
        if let Some(v) = patch.symbol_allowlist {
            s.guardrails.symbol_allowlist = v;
        }
        if let Some(v) = patch.kill_switch {
            s.guardrails.kill_switch = v;
        }

        let after = serde_json::to_value(&s.guardrails).ok();
        self.audit.record(actor, "guardrails.set", before, after);
    }

    pub fn trigger_cooldown(&self, minutes: i64, actor: &str) {
        let mut s = self.state.write();
        let before = s.guardrails.cooldown_until_ts;
        s.guardrails.cooldown_until_ts = Some(Utc::now() + chrono::Duration::minutes(minutes));
        s.cooldown_cause = Some(CooldownCause::Manual);
        self.audit.record(
            actor,
            "guardrails.trigger_cooldown",
            serde_json::to_value(before).ok(),
            serde_json::to_value(s.guardrails.cooldown_until_ts).ok(),
        );
    }

    pub fn clear_cooldown(&self, actor: &str) {
        let mut s = self.state.write();
        let before = s.guardrails.cooldown_until_ts;
        s.guardrails.cooldown_until_ts = None;
        s.cooldown_cause = None;
        self.audit.record(
            actor,
            "guardrails.clear_cooldown",
            serde_json::to_value(before).ok(),
            Some(serde_json::Value::Null),
        );
    }

    pub fn kill(&self, actor: &str) {
        let mut s = self.state.write();
        s.guardrails.kill_switch = true;
        self.audit.record(actor, "guardrails.kill", Some(serde_json::json!(false)), Some(serde_json::json!(true)));
    }

    pub fn unkill(&self, actor: &str) {
        let mut s = self.state.write();
        s.guardrails.kill_switch = false;
        self.audit.record(actor, "guardrails.unkill", Some(serde_json::json!(true)), Some(serde_json::json!(false)));
    }

    /// Record a completed trade's realized PnL for the daily-loss accounting.
    pub fn record_realized_pnl(&self, pnl: f64) {
        self.maybe_reset_daily();
        self.state.write().realized_pnl_today += pnl;
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> GuardrailsState {
        self.maybe_reset_daily();
        let s = self.state.read();
        let now = Utc::now();
        let (active, seconds_left) = match s.guardrails.cooldown_until_ts {
            Some(until) if until > now => (true, (until - now).num_milliseconds() as f64 / 1000.0),
            _ => (false, 0.0),
        };
        GuardrailsState {
            guardrails: s.guardrails.clone(),
            cooldown_active: active,
            cooldown_seconds_left: seconds_left,
        }
    }

    pub fn realized_pnl_today(&self) -> f64 {
        self.maybe_reset_daily();
        self.state.read().realized_pnl_today
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    /// Reset at a configured local-midnight boundary; idempotent if crossed
    /// multiple times (guarded by the double-checked `current_date` compare).
    fn maybe_reset_daily(&self) {
        let today = self.today_in_configured_tz();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            s.realized_pnl_today = 0.0;
            if s.cooldown_cause == Some(CooldownCause::DailyLoss) {
                s.guardrails.cooldown_until_ts = None;
                s.cooldown_cause = None;
            }
            s.current_date = today;
        }
    }

    fn today_in_configured_tz(&self) -> String {
        // The only timezone handling this build supports is UTC; a
        // non-UTC `local_midnight_tz` currently falls back to UTC boundaries.
        let _ = &self.local_midnight_tz;
        Utc::now().format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn engine() -> RiskEngine {
        RiskEngine::new(Arc::new(AuditLog::new()), "UTC")
    }

    fn ctx() -> EvaluateContext {
        EvaluateContext {
            unrealized_pnl: 0.0,
            prediction_latency_ms: Some(100),
            bar_close_ts: 1000,
        }
    }

    #[test]
    fn kill_switch_rejects_first() {
        let engine = engine();
        engine.kill("tester");
        let signal = Signal::new(Symbol::new("BTCUSDT"), Side::Buy, 0.9, 100.0, "momentum");
        let result = engine.evaluate(signal, &ctx(), 5.0, 250.0);
        assert_eq!(result.unwrap_err(), RejectReason::Killed);
    }

    #[test]
    fn low_confidence_rejected_before_notional_clamp() {
        let engine = engine();
        let signal = Signal::new(Symbol::new("BTCUSDT"), Side::Buy, 0.1, 100.0, "momentum");
        let result = engine.evaluate(signal, &ctx(), 5.0, 250.0);
        assert_eq!(result.unwrap_err(), RejectReason::LowConfidence);
    }

    #[test]
    fn notional_clamp_mutates_but_never_rejects() {
        let engine = engine();
        let signal = Signal::new(Symbol::new("BTCUSDT"), Side::Buy, 0.9, 10_000.0, "momentum");
        let result = engine.evaluate(signal, &ctx(), 5.0, 250.0).unwrap();
        assert_eq!(result.intended_notional_usd, 250.0);
        assert!(result.prediction_ref.is_some());
    }

    #[test]
    fn daily_loss_breach_sets_cooldown() {
        let engine = engine();
        engine.set_guardrails(
            GuardrailsPatch {
                max_daily_loss_usd: Some(-10.0),
                ..Default::default()
            },
            "tester",
        );
        let heavy_loss_ctx = EvaluateContext {
            unrealized_pnl: -50.0,
            prediction_latency_ms: Some(100),
            bar_close_ts: 1,
        };
        let signal = Signal::new(Symbol::new("BTCUSDT"), Side::Buy, 0.9, 100.0, "momentum");
        let result = engine.evaluate(signal, &heavy_loss_ctx, 5.0, 250.0);
        assert_eq!(result.unwrap_err(), RejectReason::DailyLossLimit);
        assert!(engine.snapshot().cooldown_active);
    }

    #[test]
    fn symbol_not_in_allowlist_is_rejected() {
        let engine = engine().with_allowlist([Symbol::new("ETHUSDT")]);
        let signal = Signal::new(Symbol::new("BTCUSDT"), Side::Buy, 0.9, 100.0, "momentum");
        let result = engine.evaluate(signal, &ctx(), 5.0, 250.0);
        assert_eq!(result.unwrap_err(), RejectReason::SymbolNotAllowed);
    }
}
