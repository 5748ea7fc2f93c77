use serde::{Deserialize, Serialize};

use crate::indicators::{macd_required_len, IndicatorSnapshot};
use crate::models::Candle;

/// Configuration for entry-signal scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_period: usize,
    pub rsi_threshold: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
    pub bollinger_touch_tolerance: f64, // fraction above the lower band still counted as a touch
    pub volume_window: usize,
    pub min_volume_usd: f64, // quote volume over volume_window
    pub breakout_lookback: usize,
    pub breakout_tolerance: f64, // fraction above the recent high
    pub min_conditions: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_threshold: 28.0,
            ema_fast: 9,
            ema_slow: 21,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
            bollinger_touch_tolerance: 0.005,
            volume_window: 20,
            min_volume_usd: 500_000.0,
            breakout_lookback: 5,
            breakout_tolerance: 0.0007,
            min_conditions: 4,
        }
    }
}

impl SignalConfig {
    /// Candles needed by the longest indicator window
    pub fn required_candles(&self) -> usize {
        [
            self.rsi_period + 1,
            self.ema_fast,
            self.ema_slow,
            macd_required_len(self.macd_slow, self.macd_signal),
            self.bollinger_period,
            self.volume_window,
            self.breakout_lookback + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// The six independently evaluated entry conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConditions {
    pub rsi_oversold: bool,
    pub ema_bullish: bool,
    pub macd_bullish: bool,
    pub bollinger_touch: bool,
    pub volume_confirmed: bool,
    pub breakout_confirmed: bool,
}

impl EntryConditions {
    pub fn satisfied_count(&self) -> usize {
        [
            self.rsi_oversold,
            self.ema_bullish,
            self.macd_bullish,
            self.bollinger_touch,
            self.volume_confirmed,
            self.breakout_confirmed,
        ]
        .iter()
        .filter(|c| **c)
        .count()
    }

    /// Threshold-of-N rule; no single condition is mandatory
    pub fn meets_threshold(&self, min_conditions: usize) -> bool {
        self.satisfied_count() >= min_conditions
    }

    /// Short human-readable form, e.g. `RSI EMA MACD -- -- --`
    pub fn summary(&self) -> String {
        let flag = |on: bool, label: &'static str| if on { label } else { "--" };
        [
            flag(self.rsi_oversold, "RSI"),
            flag(self.ema_bullish, "EMA"),
            flag(self.macd_bullish, "MACD"),
            flag(self.bollinger_touch, "BB"),
            flag(self.volume_confirmed, "VOL"),
            flag(self.breakout_confirmed, "BRK"),
        ]
        .join(" ")
    }
}

/// Score a snapshot against the latest candle
pub fn evaluate_conditions(
    snapshot: &IndicatorSnapshot,
    latest: &Candle,
    config: &SignalConfig,
) -> EntryConditions {
    let close = latest.close;

    EntryConditions {
        rsi_oversold: snapshot.rsi < config.rsi_threshold,
        ema_bullish: snapshot.ema_fast > snapshot.ema_slow,
        macd_bullish: snapshot.macd > snapshot.macd_signal,
        bollinger_touch: close <= snapshot.bollinger_lower * (1.0 + config.bollinger_touch_tolerance),
        volume_confirmed: latest.volume > snapshot.volume_avg
            && snapshot.quote_volume >= config.min_volume_usd,
        breakout_confirmed: close > snapshot.recent_high * (1.0 + config.breakout_tolerance),
    }
}

/// Check that candles are oldest-first and free of gaps wider than 1.5x the interval
pub fn validate_candle_uniformity(
    candles: &[Candle],
    expected_interval_secs: u64,
) -> anyhow::Result<()> {
    if candles.len() < 2 {
        return Ok(());
    }

    // Allow 50% tolerance for slight timing variations
    let max_gap_secs = expected_interval_secs + (expected_interval_secs / 2);

    for window in candles.windows(2) {
        let time_diff = (window[1].open_time - window[0].open_time).num_seconds();

        if time_diff <= 0 {
            anyhow::bail!("Candles are not sorted by open time");
        }

        if time_diff as u64 > max_gap_secs {
            anyhow::bail!(
                "Data gap detected: {}s between candles (expected ~{}s). Gap from {} to {}",
                time_diff,
                expected_interval_secs,
                window[0].open_time.format("%H:%M:%S"),
                window[1].open_time.format("%H:%M:%S")
            );
        }
    }

    Ok(())
}
