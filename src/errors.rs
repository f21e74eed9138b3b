// =============================================================================
// Core error taxonomy
// =============================================================================
//
// Named, matchable error kinds for the boundaries that need to branch on
// *what* went wrong (Risk rejections, the HTTP surface, retry policy). Internal
// plumbing (file I/O, the exchange REST client, WS connects) keeps using
// `anyhow::Result` with `.context(...)`, same as the rest of this crate — only
// the kinds the core contract names explicitly get a `CoreError` variant.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize)]
#[serde(tag = "error", content = "detail")]
pub enum CoreError {
    // --- Transient infrastructure -------------------------------------------
    #[error("write unavailable: {0}")]
    WriteUnavailable(String),
    #[error("websocket disconnected: {0}")]
    WsDisconnected(String),
    #[error("event bus overflow on topic {0}")]
    BusOverflow(String),
    #[error("model predict timed out after {0}ms")]
    ModelTimeout(u64),

    // --- Data quality --------------------------------------------------------
    #[error("outlier tick rejected for {symbol}: {reason}")]
    OutlierTick { symbol: String, reason: String },
    #[error("features stale for {symbol}: {staleness_seconds}s")]
    StaleFeatures {
        symbol: String,
        staleness_seconds: f64,
    },
    #[error("no fresh price for {0}")]
    StalePrice(String),

    // --- Policy rejection ----------------------------------------------------
    #[error("policy rejected: {0}")]
    PolicyRejected(String),

    // --- Programmer error ------------------------------------------------------
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // --- Fatal -----------------------------------------------------------------
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Stable, machine-readable kind name used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WriteUnavailable(_) => "write_unavailable",
            Self::WsDisconnected(_) => "ws_disconnected",
            Self::BusOverflow(_) => "bus_overflow",
            Self::ModelTimeout(_) => "model_timeout",
            Self::OutlierTick { .. } => "outlier_tick",
            Self::StaleFeatures { .. } => "stale_features",
            Self::StalePrice(_) => "stale_price",
            Self::PolicyRejected(_) => "policy_rejected",
            Self::InvalidInput(_) => "invalid_input",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether a caller should retry this kind of failure with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WriteUnavailable(_)
                | Self::WsDisconnected(_)
                | Self::BusOverflow(_)
                | Self::ModelTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_machine_name() {
        assert_eq!(CoreError::StalePrice("BTCUSDT".into()).kind(), "stale_price");
        assert_eq!(
            CoreError::PolicyRejected("daily_loss_limit".into()).kind(),
            "policy_rejected"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(CoreError::ModelTimeout(500).is_transient());
        assert!(!CoreError::InvalidInput("bad enum".into()).is_transient());
        assert!(!CoreError::Fatal("store unwritable".into()).is_transient());
    }
}
