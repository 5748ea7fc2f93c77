use super::moving_average::{calculate_ema, calculate_ema_series};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Minimum number of prices for a MACD with a defined signal line
pub fn macd_required_len(slow: usize, signal: usize) -> usize {
    slow + signal - 1
}

/// MACD line = EMA(fast) - EMA(slow); signal = EMA(signal) of the MACD line
pub fn calculate_macd(prices: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || signal == 0 || fast >= slow || prices.len() < macd_required_len(slow, signal) {
        return None;
    }

    let fast_series = calculate_ema_series(prices, fast)?;
    let slow_series = calculate_ema_series(prices, slow)?;

    // fast_series starts at prices[fast - 1], slow_series at prices[slow - 1]
    let offset = slow - fast;
    let macd_line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, slow_ema)| fast_series[i + offset] - slow_ema)
        .collect();

    let macd = *macd_line.last()?;
    let signal_value = calculate_ema(&macd_line, signal)?;

    Some(Macd {
        macd,
        signal: signal_value,
        histogram: macd - signal_value,
    })
}
