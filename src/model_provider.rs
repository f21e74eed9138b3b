// =============================================================================
// Model Provider (C5)
// =============================================================================
//
// Exposes a single prediction capability with strict latency/freshness
// policy and a deterministic fallback. The teacher repo has no model-serving
// layer of its own (predictions were folded directly into `strategy.rs`'s
// scoring); this module is new relative to the teacher, built in the same
// atomic-state-swap idiom `runtime_config.rs`/`risk.rs` already use, enriched
// with the "deterministic synthetic signal" pattern the retrieval pack shows
// for stub/test model providers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::domain::{FeatureVector, Prediction};
use crate::event_bus::{EventBus, TOPIC_EVENTS};
use crate::types::Symbol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveModel {
    pub name: String,
    pub version: String,
    pub loaded_at: chrono::DateTime<Utc>,
}

/// Entry/exit thresholds and calibration metadata for one model (§4.5,
/// second paragraph). Opaque to the core beyond this mapping.
#[derive(Debug, Clone, Copy)]
pub struct ModelPolicy {
    pub entry_threshold: f64,
    pub exit_threshold: f64,
}

impl Default for ModelPolicy {
    fn default() -> Self {
        Self {
            entry_threshold: 0.58,
            exit_threshold: 0.42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalIntent {
    Buy,
    Sell,
    Hold,
}

impl ModelPolicy {
    pub fn intent(&self, prob_up: f64) -> SignalIntent {
        if prob_up >= self.entry_threshold {
            SignalIntent::Buy
        } else if prob_up <= self.exit_threshold {
            SignalIntent::Sell
        } else {
            SignalIntent::Hold
        }
    }
}

struct Inner {
    active: ActiveModel,
    policy: ModelPolicy,
}

pub struct ModelProvider {
    state: RwLock<Inner>,
    model_switches_total: AtomicU64,
    timeout: Duration,
    feature_staleness_s: f64,
    event_bus: Arc<EventBus>,
}

impl ModelProvider {
    pub fn new(timeout: Duration, feature_staleness_s: f64, event_bus: Arc<EventBus>) -> Self {
        Self {
            state: RwLock::new(Inner {
                active: ActiveModel {
                    name: "stub".to_string(),
                    version: "1".to_string(),
                    loaded_at: Utc::now(),
                },
                policy: ModelPolicy::default(),
            }),
            model_switches_total: AtomicU64::new(0),
            timeout,
            feature_staleness_s,
            event_bus,
        }
    }

    pub fn active(&self) -> ActiveModel {
        self.state.read().active.clone()
    }

    pub fn policy(&self) -> ModelPolicy {
        self.state.read().policy
    }

    /// Atomic model swap. Emits a `ModelSwitched` event on the bus (§4.5).
    pub fn select(&self, name: impl Into<String>) {
        let name = name.into();
        let mut s = self.state.write();
        s.active = ActiveModel {
            name: name.clone(),
            version: "1".to_string(),
            loaded_at: Utc::now(),
        };
        self.model_switches_total.fetch_add(1, Ordering::Relaxed);
        let version = s.active.version.clone();
        drop(s);

        self.event_bus.publish(
            TOPIC_EVENTS,
            serde_json::json!({"kind": "ModelSwitched", "name": name, "version": version}),
        );
    }

    pub fn model_switches_total(&self) -> u64 {
        self.model_switches_total.load(Ordering::Relaxed)
    }

    /// Must return within `timeout_ms`. Falls back to the deterministic stub
    /// whenever features are stale, the real predictor is unavailable, or
    /// the deadline is exceeded.
    pub async fn predict(
        &self,
        symbol: &Symbol,
        horizon: &str,
        features: Option<&FeatureVector>,
    ) -> Prediction {
        let start = Instant::now();

        if let Some(fv) = features {
            if fv.staleness_seconds > self.feature_staleness_s {
                return self.fallback(symbol, horizon, start, "stale_features");
            }
        } else {
            return self.fallback(symbol, horizon, start, "no_features");
        }

        match timeout(self.timeout, self.call_underlying(symbol, horizon)).await {
            Ok(Some(prediction)) => prediction,
            Ok(None) => self.fallback(symbol, horizon, start, "model_unavailable"),
            Err(_) => {
                warn!(symbol = %symbol, "model predict timed out");
                self.fallback(symbol, horizon, start, "timeout")
            }
        }
    }

    /// No real model is wired in this build; always defers to the
    /// deterministic fallback. Kept as its own async step so a future model
    /// backend only needs to replace this function.
    async fn call_underlying(&self, _symbol: &Symbol, _horizon: &str) -> Option<Prediction> {
        None
    }

    fn fallback(&self, symbol: &Symbol, horizon: &str, start: Instant, reason: &str) -> Prediction {
        let bucket = Utc::now().timestamp() / 60;
        let seed = symbol_hash(symbol.as_str()) as f64 + bucket as f64;
        let prob_up = 0.5 + 0.5 * (seed * 0.017453292519943295).sin() * 0.4;

        Prediction {
            symbol: symbol.clone(),
            horizon: horizon.to_string(),
            prob_up: prob_up.clamp(0.0, 1.0),
            confidence: 0.5,
            model_name: "stub".to_string(),
            is_fallback: true,
            fallback_reason: Some(reason.to_string()),
            staleness_seconds: 0.0,
            computed_at: Utc::now(),
            latency_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn symbol_hash(symbol: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    hasher.finish() % 360
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn predict_falls_back_without_features() {
        let provider = ModelProvider::new(Duration::from_millis(500), 60.0, Arc::new(crate::event_bus::EventBus::new()));
        let prediction = provider.predict(&Symbol::new("BTCUSDT"), "60s", None).await;
        assert!(prediction.is_fallback);
        assert_eq!(prediction.model_name, "stub");
        assert_eq!(prediction.fallback_reason.as_deref(), Some("no_features"));
    }

    #[tokio::test]
    async fn predict_falls_back_on_stale_features() {
        let provider = ModelProvider::new(Duration::from_millis(500), 10.0, Arc::new(crate::event_bus::EventBus::new()));
        let stale = FeatureVector {
            symbol: Symbol::new("BTCUSDT"),
            computed_at: Utc::now(),
            window_size: 10,
            price_history: vec![1.0; 10],
            returns_1: None,
            returns_5: None,
            returns_10: None,
            ma_20: None,
            rsi_14: None,
            volatility: None,
            z_score_60: None,
            atr_14: None,
            staleness_seconds: 100.0,
        };
        let prediction = provider.predict(&Symbol::new("BTCUSDT"), "60s", Some(&stale)).await;
        assert!(prediction.is_fallback);
        assert_eq!(prediction.fallback_reason.as_deref(), Some("stale_features"));
    }

    #[test]
    fn select_increments_switch_counter_and_swaps_active() {
        let provider = ModelProvider::new(Duration::from_millis(500), 60.0, Arc::new(crate::event_bus::EventBus::new()));
        provider.select("momentum-v2");
        assert_eq!(provider.active().name, "momentum-v2");
        assert_eq!(provider.model_switches_total(), 1);
    }

    #[test]
    fn policy_maps_prob_up_to_signal_intent() {
        let policy = ModelPolicy::default();
        assert_eq!(policy.intent(0.9), SignalIntent::Buy);
        assert_eq!(policy.intent(0.1), SignalIntent::Sell);
        assert_eq!(policy.intent(0.5), SignalIntent::Hold);
    }
}
