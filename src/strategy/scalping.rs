use super::signals::{evaluate_conditions, SignalConfig};
use super::{SignalEvaluation, Strategy};
use crate::error::IndicatorError;
use crate::indicators::compute_snapshot;
use crate::models::Candle;

/// Six-condition oversold-bounce scalping entry
///
/// Buys when at least `min_conditions` of RSI oversold, EMA cross, MACD cross,
/// lower-band touch, volume confirmation and breakout agree.
pub struct ScalpingStrategy {
    config: SignalConfig,
}

impl ScalpingStrategy {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }
}

impl Default for ScalpingStrategy {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

impl Strategy for ScalpingStrategy {
    fn evaluate(&self, candles: &[Candle]) -> Result<SignalEvaluation, IndicatorError> {
        let snapshot = compute_snapshot(candles, &self.config)?;
        let latest = candles.last().ok_or(IndicatorError::InsufficientData {
            required: self.min_candles_required(),
            available: 0,
        })?;

        let conditions = evaluate_conditions(&snapshot, latest, &self.config);
        let entry_signal = conditions.meets_threshold(self.config.min_conditions);

        Ok(SignalEvaluation {
            snapshot,
            conditions,
            close: latest.close,
            entry_signal,
        })
    }

    fn name(&self) -> &str {
        "RSI Scalping"
    }

    fn min_candles_required(&self) -> usize {
        self.config.required_candles()
    }
}
