// Technical indicators module
// Implements RSI, EMA, MACD, Bollinger Bands and volume/breakout levels

pub mod bollinger;
pub mod macd;
pub mod market_analysis;
pub mod moving_average;
pub mod rsi;
pub mod snapshot;

pub use bollinger::{calculate_bollinger, BollingerBands};
pub use macd::{calculate_macd, macd_required_len, Macd};
pub use market_analysis::{calculate_average_volume, calculate_quote_volume, calculate_recent_high};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use rsi::calculate_rsi;
pub use snapshot::{compute_snapshot, IndicatorSnapshot};
