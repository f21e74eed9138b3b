// =============================================================================
// Environment-driven process configuration (spec §6 env var table)
// =============================================================================

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub symbols: Vec<String>,
    pub exchange_ws_url: String,
    pub slippage_bps: f64,
    pub fee_taker_bps: f64,
    pub fee_maker_bps: f64,
    pub risk_min_notional: f64,
    pub risk_max_notional: f64,
    pub max_daily_loss: f64,
    pub max_pos_notional: f64,
    pub model_timeout_ms: u64,
    pub feature_staleness_s: f64,
    pub db_batch_size: usize,
    pub db_flush_interval_sec: f64,
    pub stream_maxlen: usize,
    pub heartbeat_interval_s: u64,
    pub heartbeat_gap_s: u64,
    pub local_midnight_tz: String,
}

impl CoreConfig {
    /// Load configuration from the process environment, applying the
    /// defaults listed in spec §6. `EXCHANGE_WS_URL` has no usable default —
    /// a missing value falls back to the well-known Binance combined-stream
    /// endpoint so the crate still boots in demo mode without a `.env` file.
    pub fn from_env() -> Self {
        let symbols_raw: String =
            std::env::var("SYMBOLS").unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string());
        let symbols = symbols_raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            symbols,
            exchange_ws_url: std::env::var("EXCHANGE_WS_URL")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443/stream".to_string()),
            slippage_bps: env_or("SLIPPAGE_BPS", 2.0),
            fee_taker_bps: env_or("FEE_TAKER_BPS", 5.0),
            fee_maker_bps: env_or("FEE_MAKER_BPS", 2.0),
            risk_min_notional: env_or("RISK_MIN_NOTIONAL", 5.0),
            risk_max_notional: env_or("RISK_MAX_NOTIONAL", 250.0),
            max_daily_loss: env_or("MAX_DAILY_LOSS", -200.0),
            max_pos_notional: env_or("MAX_POS_NOTIONAL", 2000.0),
            model_timeout_ms: env_or("MODEL_TIMEOUT_MS", 500),
            feature_staleness_s: env_or("FEATURE_STALENESS_S", 60.0),
            db_batch_size: env_or("DB_BATCH_SIZE", 500),
            db_flush_interval_sec: env_or("DB_FLUSH_INTERVAL_SEC", 0.25),
            stream_maxlen: env_or("STREAM_MAXLEN", 10_000),
            heartbeat_interval_s: env_or("HEARTBEAT_INTERVAL_S", 10),
            heartbeat_gap_s: env_or("HEARTBEAT_GAP_S", 60),
            local_midnight_tz: std::env::var("LOCAL_MIDNIGHT_TZ")
                .unwrap_or_else(|_| "UTC".to_string()),
        }
    }

    pub fn db_flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.db_flush_interval_sec)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table_when_unset() {
        // Avoid clobbering a developer's real environment — only assert on
        // keys we are confident are unset in a clean test process and that
        // this test itself does not set.
        std::env::remove_var("SLIPPAGE_BPS");
        std::env::remove_var("SYMBOLS");
        let cfg = CoreConfig::from_env();
        assert_eq!(cfg.slippage_bps, 2.0);
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.local_midnight_tz, "UTC");
    }

    #[test]
    fn parses_symbol_csv_uppercased_and_trimmed() {
        std::env::set_var("SYMBOLS", " btcusdt, ethusdt ,solusdt");
        let cfg = CoreConfig::from_env();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        std::env::remove_var("SYMBOLS");
    }
}
