use serde::{Deserialize, Serialize};

use crate::models::Ticker24h;

/// Pre-entry filter on the pair itself, ahead of any indicator work.
///
/// Blacklisted symbols are never traded. Spread and 24h volatility need a
/// ticker and are skipped when their threshold is 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairScreen {
    pub blacklist: Vec<String>,
    /// Widest bid/ask spread accepted, percent of bid
    pub max_spread_pct: f64,
    /// Smallest absolute 24h price change accepted, percent
    pub min_volatility_pct: f64,
}

impl Default for PairScreen {
    fn default() -> Self {
        Self {
            blacklist: ["XRPUSDC", "DOGEUSDC", "PEPEUSDC"].iter().map(|s| s.to_string()).collect(),
            max_spread_pct: 0.15,
            min_volatility_pct: 0.7,
        }
    }
}

impl PairScreen {
    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.blacklist.iter().any(|s| s.eq_ignore_ascii_case(symbol))
    }

    /// Whether `check_ticker` has anything to check
    pub fn needs_ticker(&self) -> bool {
        self.max_spread_pct > 0.0 || self.min_volatility_pct > 0.0
    }

    /// Reason to skip the pair, or None when it passes
    pub fn check_ticker(&self, ticker: &Ticker24h) -> Option<String> {
        if self.max_spread_pct > 0.0 {
            match ticker.spread_pct() {
                Some(spread) if spread <= self.max_spread_pct => {}
                Some(spread) => {
                    return Some(format!("spread {:.3}% above {:.3}%", spread, self.max_spread_pct));
                }
                None => return Some("no bid".to_string()),
            }
        }

        let volatility = ticker.price_change_pct.abs();
        if self.min_volatility_pct > 0.0 && volatility < self.min_volatility_pct {
            return Some(format!(
                "24h volatility {:.2}% below {:.2}%",
                volatility, self.min_volatility_pct
            ));
        }

        None
    }
}
