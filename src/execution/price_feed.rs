use std::sync::Arc;

use crate::api::Exchange;
use crate::error::ExchangeError;
use crate::execution::retry::{with_retry, RetryPolicy};
use crate::models::{Candle, Ticker24h};

/// Market data for the tracked symbols, with every call bounded by the retry policy
#[derive(Clone)]
pub struct MarketFeed {
    exchange: Arc<dyn Exchange>,
    retry: RetryPolicy,
    interval: String,
    candle_limit: usize,
}

impl MarketFeed {
    pub fn new(exchange: Arc<dyn Exchange>, retry: RetryPolicy, interval: impl Into<String>, candle_limit: usize) -> Self {
        Self {
            exchange,
            retry,
            interval: interval.into(),
            candle_limit,
        }
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    /// Candle spacing in seconds, if the interval string is recognised
    pub fn interval_seconds(&self) -> Option<u64> {
        interval_seconds(&self.interval)
    }

    /// Fetch the latest candle window, oldest first
    pub async fn candles(&self, symbol: &str) -> Result<Vec<Candle>, ExchangeError> {
        let label = format!("get_candles {}", symbol);
        let mut candles = with_retry(&self.retry, &label, || {
            self.exchange.get_candles(symbol, &self.interval, self.candle_limit)
        })
        .await?;

        candles.sort_by_key(|c| c.open_time);

        tracing::debug!(
            symbol = %symbol,
            count = candles.len(),
            "Fetched candles"
        );

        Ok(candles)
    }

    pub async fn price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let label = format!("get_price {}", symbol);
        let price = with_retry(&self.retry, &label, || self.exchange.get_current_price(symbol)).await?;

        if !price.is_finite() || price <= 0.0 {
            return Err(ExchangeError::InvalidResponse(format!(
                "price {} for {}",
                price, symbol
            )));
        }
        Ok(price)
    }

    pub async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, ExchangeError> {
        let label = format!("get_ticker_24h {}", symbol);
        with_retry(&self.retry, &label, || self.exchange.get_ticker_24h(symbol)).await
    }
}

/// Parse exchange kline intervals such as `1m`, `15m`, `1h`, `1d`
pub fn interval_seconds(interval: &str) -> Option<u64> {
    if !interval.is_ascii() {
        return None;
    }
    let (value, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let value: u64 = value.parse().ok()?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    (value > 0).then_some(value * unit_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_seconds() {
        assert_eq!(interval_seconds("1m"), Some(60));
        assert_eq!(interval_seconds("15m"), Some(900));
        assert_eq!(interval_seconds("4h"), Some(14_400));
        assert_eq!(interval_seconds("1d"), Some(86_400));
    }

    #[test]
    fn test_interval_seconds_rejects_garbage() {
        assert_eq!(interval_seconds(""), None);
        assert_eq!(interval_seconds("m"), None);
        assert_eq!(interval_seconds("0m"), None);
        assert_eq!(interval_seconds("1M"), None); // monthly is not a fixed width
        assert_eq!(interval_seconds("xh"), None);
    }
}
