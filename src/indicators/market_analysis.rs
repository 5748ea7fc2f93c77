/// Volume and price-level analysis over candle windows

use crate::models::Candle;

/// Average base volume over the last `period` candles (current candle included)
pub fn calculate_average_volume(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let start_idx = candles.len() - period;
    let total_volume: f64 = candles[start_idx..].iter().map(|c| c.volume).sum();
    Some(total_volume / period as f64)
}

/// Quote-currency volume traded over the last `period` candles
pub fn calculate_quote_volume(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let start_idx = candles.len() - period;
    Some(candles[start_idx..].iter().map(|c| c.quote_volume).sum())
}

/// Highest high of the `lookback` candles preceding the current one.
///
/// The current (last) candle is excluded so a breakout compares the latest
/// close against prior resistance.
pub fn calculate_recent_high(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback == 0 || candles.len() < lookback + 1 {
        return None;
    }

    let end_idx = candles.len() - 1;
    let start_idx = end_idx - lookback;
    candles[start_idx..end_idx]
        .iter()
        .map(|c| c.high)
        .fold(None, |acc: Option<f64>, h| Some(acc.map_or(h, |a| a.max(h))))
}
