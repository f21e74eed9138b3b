// =============================================================================
// Paper Execution Engine (C9)
// =============================================================================
//
// Deterministic, fair-fill order simulation, position accounting, and
// mark-to-market. Generalizes the teacher's `execution.rs::ExecutionEngine`
// (risk-check-then-branch shape, demo-mode synthetic fill) and
// `position_engine.rs::PositionManager` (the `RwLock<Vec<Position>>`
// open/closed split, recompute-PnL-on-price-update) from the teacher's fixed
// SL/TP-ladder model to the spec's general weighted-average-entry /
// proportional-realization-with-sign-flip formulas (§4.9).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::domain::{EquitySnapshot, Fill, Order, OrderType, Position, Trade};
use crate::errors::CoreError;
use crate::event_bus::{EventBus, TOPIC_FILLS};
use crate::tick_store::TickStore;
use crate::types::{Side, Symbol};

pub struct PaperExecutionConfig {
    pub starting_cash: f64,
    pub slippage_bps: f64,
    pub fee_taker_bps: f64,
    pub fee_maker_bps: f64,
    pub freshness_window_s: f64,
}

struct Inner {
    cash: f64,
    realized_pnl_to_date: f64,
    equity_peak: f64,
    positions: HashMap<Symbol, Position>,
    orders_by_request_id: HashMap<String, (Order, Fill)>,
    trades: Vec<Trade>,
    equity_history: Vec<EquitySnapshot>,
    last_snapshot_at: Option<chrono::DateTime<Utc>>,
}

pub struct PaperExecutionEngine {
    state: RwLock<Inner>,
    config: PaperExecutionConfig,
    tick_store: Arc<TickStore>,
    event_bus: Arc<EventBus>,
}

impl PaperExecutionEngine {
    pub fn new(config: PaperExecutionConfig, tick_store: Arc<TickStore>, event_bus: Arc<EventBus>) -> Self {
        let starting_cash = config.starting_cash;
        Self {
            state: RwLock::new(Inner {
                cash: starting_cash,
                realized_pnl_to_date: 0.0,
                equity_peak: starting_cash,
                positions: HashMap::new(),
                orders_by_request_id: HashMap::new(),
                trades: Vec::new(),
                equity_history: Vec::new(),
                last_snapshot_at: None,
            }),
            config,
            tick_store,
            event_bus,
        }
    }

    /// Step 1-6 of §4.9's order flow. Idempotent on `client_request_id`.
    pub fn submit_order(
        &self,
        symbol: Symbol,
        side: Side,
        notional_usd: f64,
        client_request_id: String,
        now_ns: i64,
    ) -> Result<Fill, CoreError> {
        {
            let s = self.state.read();
            if let Some((_, fill)) = s.orders_by_request_id.get(&client_request_id) {
                return Ok(fill.clone());
            }
        }

        let (reference_price, _) = self.tick_store.latest_price(&symbol, now_ns)?;

        // Step 3: slippage, adverse to the trader.
        let slippage_bps = self.config.slippage_bps;
        let fill_price = match side {
            Side::Buy => reference_price * (1.0 + slippage_bps / 10_000.0),
            Side::Sell => reference_price * (1.0 - slippage_bps / 10_000.0),
            Side::Flat => reference_price,
        };

        let quantity = notional_usd / reference_price;

        // Step 4: fee. The paper engine only ever submits market orders, so
        // the taker rate applies; maker support would read `fee_maker_bps`
        // for resting limit orders, which this engine does not place.
        let fee_usd = notional_usd * self.config.fee_taker_bps / 10_000.0;

        let order = Order {
            id: Ulid::new(),
            symbol: symbol.clone(),
            side,
            quantity,
            notional_usd,
            requested_price: reference_price,
            order_type: OrderType::Market,
            created_at: Utc::now(),
            client_request_id: client_request_id.clone(),
        };

        let fill = Fill {
            order_id: order.id,
            symbol: symbol.clone(),
            side,
            quantity,
            fill_price,
            slippage_bps,
            fee_usd,
            filled_at: Utc::now(),
        };

        let maybe_trade = {
            let mut s = self.state.write();
            let trade = self.apply_fill(&mut s, &fill);
            if let Some(t) = &trade {
                s.trades.push(t.clone());
            }
            s.orders_by_request_id
                .insert(client_request_id, (order, fill.clone()));
            trade
        };

        if let Ok(payload) = serde_json::to_value(&fill) {
            self.event_bus.publish(TOPIC_FILLS, payload);
        }
        if let Some(trade) = maybe_trade {
            self.event_bus.publish("events", serde_json::json!({"kind": "trade", "trade": trade}));
        }
        self.maybe_snapshot(true);

        Ok(fill)
    }

    /// Step 5: volume-weighted average entry on increases, proportional
    /// realization with sign-flip on decreases. Returns a `Trade` if the
    /// position fully closed (quantity returned to zero or flipped).
    fn apply_fill(&self, s: &mut Inner, fill: &Fill) -> Option<Trade> {
        let now = fill.filled_at;
        let signed_fill_qty = fill.quantity * fill.side.sign();

        let pos = s
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::flat(fill.symbol.clone(), now));

        let old_qty = pos.quantity_signed;
        let new_qty_raw = old_qty + signed_fill_qty;

        let same_direction_or_opening = old_qty == 0.0 || old_qty.signum() == signed_fill_qty.signum();

        let mut trade = None;

        if same_direction_or_opening {
            // Opening or increasing: volume-weighted average entry.
            let old_abs = old_qty.abs();
            let fill_abs = signed_fill_qty.abs();
            pos.average_entry_price = if old_abs + fill_abs > 0.0 {
                (old_abs * pos.average_entry_price + fill_abs * fill.fill_price) / (old_abs + fill_abs)
            } else {
                fill.fill_price
            };
            pos.quantity_signed = new_qty_raw;
            s.cash -= signed_fill_qty * fill.fill_price + fill.fee_usd;
        } else {
            // Decreasing or closing: realize P&L on the closed portion.
            let closed_qty = signed_fill_qty.abs().min(old_qty.abs());
            let realized = closed_qty * (fill.fill_price - pos.average_entry_price) * old_qty.signum()
                - fill.fee_usd;
            s.realized_pnl_to_date += realized;
            s.cash += closed_qty * fill.fill_price - fill.fee_usd;

            trade = Some(Trade {
                symbol: fill.symbol.clone(),
                open_fill_ref: fill.order_id,
                close_fill_ref: fill.order_id,
                realized_pnl_usd: realized,
                rr_multiple: None,
                closed_at: now,
            });

            if new_qty_raw.abs() < f64::EPSILON {
                pos.quantity_signed = 0.0;
                pos.average_entry_price = 0.0;
            } else if new_qty_raw.signum() != old_qty.signum() {
                // Crossed zero: flip sign, reset avg entry to the fill price
                // for the newly-opened remainder.
                pos.quantity_signed = new_qty_raw;
                pos.average_entry_price = fill.fill_price;
            } else {
                pos.quantity_signed = new_qty_raw;
            }
        }

        pos.last_mark_price = fill.fill_price;
        pos.last_mark_at = now;
        pos.unrealized_pnl_usd = pos.quantity_signed * (pos.last_mark_price - pos.average_entry_price);

        if pos.is_flat() {
            s.positions.remove(&fill.symbol);
        }

        trade
    }

    /// Mark-to-market on every tick for a symbol with an open position.
    pub fn mark_to_market(&self, symbol: &Symbol, last_price: f64) {
        let mut s = self.state.write();
        if let Some(pos) = s.positions.get_mut(symbol) {
            pos.last_mark_price = last_price;
            pos.last_mark_at = Utc::now();
            pos.unrealized_pnl_usd = pos.quantity_signed * (last_price - pos.average_entry_price);
        }
        drop(s);
        self.maybe_snapshot(false);
    }

    /// Append an `EquitySnapshot` at most once per 10s, or unconditionally
    /// when `force` is set (every fill).
    fn maybe_snapshot(&self, force: bool) {
        let mut s = self.state.write();
        let now = Utc::now();
        if !force {
            if let Some(last) = s.last_snapshot_at {
                if (now - last).num_milliseconds() < 10_000 {
                    return;
                }
            }
        }

        let unrealized: f64 = s.positions.values().map(|p| p.unrealized_pnl_usd).sum();
        let mark_value: f64 = s
            .positions
            .values()
            .map(|p| p.quantity_signed * p.last_mark_price)
            .sum();
        let equity = s.cash + mark_value;
        if equity > s.equity_peak {
            s.equity_peak = equity;
        }
        let drawdown_pct = if s.equity_peak > 0.0 {
            (equity - s.equity_peak) / s.equity_peak
        } else {
            0.0
        };

        let snapshot = EquitySnapshot {
            ts: now,
            cash_balance: s.cash,
            unrealized_pnl: unrealized,
            realized_pnl_to_date: s.realized_pnl_to_date,
            equity,
            drawdown_pct,
        };
        s.equity_history.push(snapshot.clone());
        s.last_snapshot_at = Some(now);
        drop(s);

        if let Ok(payload) = serde_json::to_value(&snapshot) {
            self.event_bus.publish("events", payload);
        }
    }

    pub fn positions(&self) -> Vec<Position> {
        self.state.read().positions.values().cloned().collect()
    }

    pub fn trades(&self, limit: usize) -> Vec<Trade> {
        let s = self.state.read();
        let start = s.trades.len().saturating_sub(limit);
        s.trades[start..].to_vec()
    }

    pub fn latest_equity(&self) -> Option<EquitySnapshot> {
        self.state.read().equity_history.last().cloned()
    }

    /// Close all positions at last price (fee-free), zero realized P&L,
    /// reseed cash.
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.cash = self.config.starting_cash;
        s.realized_pnl_to_date = 0.0;
        s.equity_peak = self.config.starting_cash;
        s.positions.clear();
        s.orders_by_request_id.clear();
        s.trades.clear();
        s.equity_history.clear();
        s.last_snapshot_at = None;
        info!("paper execution engine reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick_store::{Tick, TickStoreConfig};

    fn setup() -> (PaperExecutionEngine, Arc<TickStore>) {
        let tick_store = Arc::new(TickStore::new(TickStoreConfig::default()));
        let bus = Arc::new(EventBus::new());
        let engine = PaperExecutionEngine::new(
            PaperExecutionConfig {
                starting_cash: 10_000.0,
                slippage_bps: 2.0,
                fee_taker_bps: 5.0,
                fee_maker_bps: 2.0,
                freshness_window_s: 60.0,
            },
            tick_store.clone(),
            bus,
        );
        (engine, tick_store)
    }

    fn push_tick(store: &TickStore, symbol: &str, price: f64, ts_ns: i64) {
        store
            .append_batch(vec![Tick {
                symbol: Symbol::new(symbol),
                timestamp_ns: ts_ns,
                last_price: price,
                bid: None,
                ask: None,
                bid_size: None,
                ask_size: None,
                trade_volume_delta: 0.0,
            }])
            .unwrap();
    }

    #[test]
    fn submit_order_is_idempotent_on_client_request_id() {
        let (engine, store) = setup();
        push_tick(&store, "BTCUSDT", 50_000.0, 0);
        let f1 = engine
            .submit_order(Symbol::new("BTCUSDT"), Side::Buy, 100.0, "req-1".into(), 0)
            .unwrap();
        let f2 = engine
            .submit_order(Symbol::new("BTCUSDT"), Side::Buy, 100.0, "req-1".into(), 0)
            .unwrap();
        assert_eq!(f1.order_id, f2.order_id);
    }

    #[test]
    fn submit_order_fails_without_fresh_price() {
        let (engine, _store) = setup();
        let result = engine.submit_order(Symbol::new("BTCUSDT"), Side::Buy, 100.0, "req-1".into(), 0);
        assert!(matches!(result, Err(CoreError::StalePrice(_))));
    }

    #[test]
    fn buy_applies_adverse_slippage_and_fee() {
        let (engine, store) = setup();
        push_tick(&store, "BTCUSDT", 50_000.0, 0);
        let fill = engine
            .submit_order(Symbol::new("BTCUSDT"), Side::Buy, 1000.0, "req-1".into(), 0)
            .unwrap();
        assert!(fill.fill_price > 50_000.0);
        assert!((fill.fee_usd - 1000.0 * 5.0 / 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn closing_position_realizes_pnl_and_emits_trade() {
        let (engine, store) = setup();
        push_tick(&store, "BTCUSDT", 100.0, 0);
        engine
            .submit_order(Symbol::new("BTCUSDT"), Side::Buy, 1000.0, "open".into(), 0)
            .unwrap();
        push_tick(&store, "BTCUSDT", 110.0, 1);
        let fill = engine
            .submit_order(Symbol::new("BTCUSDT"), Side::Sell, 1000.0, "close".into(), 1)
            .unwrap();
        assert!(fill.fill_price < 110.0);
        let positions = engine.positions();
        assert!(positions.is_empty() || positions[0].quantity_signed.abs() < 1e-6);
    }

    #[test]
    fn reset_zeros_realized_pnl_and_clears_positions() {
        let (engine, store) = setup();
        push_tick(&store, "BTCUSDT", 100.0, 0);
        engine
            .submit_order(Symbol::new("BTCUSDT"), Side::Buy, 1000.0, "open".into(), 0)
            .unwrap();
        engine.reset();
        assert!(engine.positions().is_empty());
        assert_eq!(engine.state.read().cash, 10_000.0);
    }

    #[test]
    fn equity_snapshot_accounts_for_open_position_value() {
        let (engine, store) = setup();
        push_tick(&store, "BTCUSDT", 100.0, 0);
        let fill = engine
            .submit_order(Symbol::new("BTCUSDT"), Side::Buy, 1000.0, "open".into(), 0)
            .unwrap();

        // Mark at the fill price: unrealized P&L is ~0, but the position's
        // full notional must still count toward equity (cash alone dropped
        // by notional + fee on open).
        engine.mark_to_market(&Symbol::new("BTCUSDT"), fill.fill_price);
        let snapshot = engine.latest_equity().unwrap();
        let cash = engine.state.read().cash;
        let position = &engine.positions()[0];
        let mark_value = position.quantity_signed * position.last_mark_price;

        assert!((snapshot.equity - (cash + mark_value)).abs() < 1e-9);
        assert!(snapshot.equity > 10_000.0 - fill.fee_usd - 1.0);
    }
}
