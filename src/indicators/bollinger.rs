use super::moving_average::calculate_sma;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// SMA(period) ± `std_dev` population standard deviations of the last `period` closes
pub fn calculate_bollinger(prices: &[f64], period: usize, std_dev: f64) -> Option<BollingerBands> {
    let middle = calculate_sma(prices, period)?;

    let window = &prices[prices.len() - period..];
    let variance = window.iter().map(|p| (p - middle).powi(2)).sum::<f64>() / period as f64;
    let width = std_dev * variance.sqrt();

    Some(BollingerBands {
        upper: middle + width,
        middle,
        lower: middle - width,
    })
}
