use serde::{Deserialize, Serialize};

use super::{
    calculate_average_volume, calculate_bollinger, calculate_ema, calculate_macd,
    calculate_quote_volume, calculate_recent_high, calculate_rsi,
};
use crate::error::IndicatorError;
use crate::models::Candle;
use crate::strategy::SignalConfig;

/// Every indicator the entry conditions read, computed from one candle window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub bollinger_lower: f64,
    pub bollinger_upper: f64,
    pub volume_avg: f64,
    /// Quote-currency volume summed over the volume window
    pub quote_volume: f64,
    pub recent_high: f64,
}

/// Compute a snapshot from oldest-first candles.
///
/// Fails with `InsufficientData` when the window is shorter than the longest
/// indicator needs; never returns a partial snapshot.
pub fn compute_snapshot(
    candles: &[Candle],
    config: &SignalConfig,
) -> Result<IndicatorSnapshot, IndicatorError> {
    let required = config.required_candles();
    let insufficient = || IndicatorError::InsufficientData {
        required,
        available: candles.len(),
    };

    if candles.len() < required {
        return Err(insufficient());
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi = calculate_rsi(&closes, config.rsi_period).ok_or_else(insufficient)?;
    let ema_fast = calculate_ema(&closes, config.ema_fast).ok_or_else(insufficient)?;
    let ema_slow = calculate_ema(&closes, config.ema_slow).ok_or_else(insufficient)?;
    let macd = calculate_macd(&closes, config.macd_fast, config.macd_slow, config.macd_signal)
        .ok_or_else(insufficient)?;
    let bands = calculate_bollinger(&closes, config.bollinger_period, config.bollinger_std_dev)
        .ok_or_else(insufficient)?;
    let volume_avg =
        calculate_average_volume(candles, config.volume_window).ok_or_else(insufficient)?;
    let quote_volume =
        calculate_quote_volume(candles, config.volume_window).ok_or_else(insufficient)?;
    let recent_high =
        calculate_recent_high(candles, config.breakout_lookback).ok_or_else(insufficient)?;

    Ok(IndicatorSnapshot {
        rsi,
        ema_fast,
        ema_slow,
        macd: macd.macd,
        macd_signal: macd.signal,
        bollinger_lower: bands.lower,
        bollinger_upper: bands.upper,
        volume_avg,
        quote_volume,
        recent_high,
    })
}
