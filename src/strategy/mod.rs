// Trading strategy module
pub mod scalping;
pub mod screen;
pub mod signals;

pub use scalping::ScalpingStrategy;
pub use screen::PairScreen;
pub use signals::{evaluate_conditions, validate_candle_uniformity, EntryConditions, SignalConfig};

use serde::{Deserialize, Serialize};

use crate::error::IndicatorError;
use crate::indicators::IndicatorSnapshot;
use crate::models::Candle;

/// Outcome of scoring one candle window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalEvaluation {
    pub snapshot: IndicatorSnapshot,
    pub conditions: EntryConditions,
    pub close: f64,
    /// Enough conditions hold; risk and portfolio gates are checked separately
    pub entry_signal: bool,
}

/// Base trait for entry strategies
pub trait Strategy: Send + Sync {
    /// Score the latest candle of an oldest-first window
    fn evaluate(&self, candles: &[Candle]) -> Result<SignalEvaluation, IndicatorError>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}
