// =============================================================================
// Shared types used across the trading core
// =============================================================================

use serde::{Deserialize, Serialize};

/// A stable, canonical symbol identifier (e.g. `BTCUSDT`).
///
/// The canonical form is uppercase with no separator. Exchanges that use a
/// separated form (`BTC/USDT`) are handled at the feed boundary via
/// [`Symbol::to_exchange`] / [`Symbol::from_exchange`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Build a `Symbol` from any input, normalizing to the canonical form.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_uppercase().replace(['/', '-', '_'], ""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render the exchange-style separated form, e.g. `BTCUSDT` -> `BTC/USDT`.
    /// Best-effort: only applies the well-known quote-asset suffixes.
    pub fn to_exchange(&self) -> String {
        const QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "BTC", "ETH"];
        for quote in QUOTES {
            if self.0.len() > quote.len() && self.0.ends_with(quote) {
                let base = &self.0[..self.0.len() - quote.len()];
                return format!("{base}/{quote}");
            }
        }
        self.0.clone()
    }

    /// Parse an exchange-style separated form back into canonical form.
    /// `toCanonical(toExchange(S)) == S` for any symbol produced by `new`.
    pub fn from_exchange(exchange: impl AsRef<str>) -> Self {
        Self::new(exchange)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Trade direction / signal side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Flat,
}

impl Side {
    /// +1.0 for Buy, -1.0 for Sell, 0.0 for Flat.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Flat => 0.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}
