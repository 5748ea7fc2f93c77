use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// OHLCV candlestick, oldest-first in every sequence we pass around
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,       // base asset
    pub quote_volume: f64, // quote asset (USDC)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Market order submission
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Unique per submission, so the order can be looked up when its response is lost
    pub client_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_price: f64,
    pub executed_qty: f64,
}

/// Paired take-profit / stop-loss (OCO) sell orders
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveOrderRequest {
    pub symbol: String,
    pub quantity: Decimal,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    /// Limit price of the stop leg, at or just below `stop_loss_price`
    pub stop_limit_price: Decimal,
    pub list_client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtectiveOrders {
    pub order_list_id: String,
    pub order_ids: Vec<String>,
}

/// Which leg of a protective pair executed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtectiveLeg {
    TakeProfit,
    StopLoss,
}

/// Exchange-side state of a protective pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProtectiveStatus {
    Open,
    Filled { leg: ProtectiveLeg, price: f64 },
    /// Gone without a fill, e.g. cancelled by hand
    Cancelled,
}

/// Rolling 24h market statistics with the current top of book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker24h {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub price_change_pct: f64,
    pub quote_volume: f64,
}

impl Ticker24h {
    /// Bid/ask spread as a percentage of the bid. None without a bid.
    pub fn spread_pct(&self) -> Option<f64> {
        (self.bid > 0.0).then(|| (self.ask - self.bid) / self.bid * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub order_list_id: Option<String>,
}

/// Exchange lot and price constraints for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// Floor a raw quantity to the lot step. Returns None below `min_qty`.
    pub fn round_quantity(&self, quantity: f64) -> Option<Decimal> {
        let raw = Decimal::from_f64(quantity)?;
        let rounded = floor_to_step(raw, self.step_size);
        if rounded <= Decimal::ZERO || rounded < self.min_qty {
            return None;
        }
        Some(rounded.normalize())
    }

    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> Option<Decimal> {
        let raw = Decimal::from_f64(price)?;
        if self.tick_size <= Decimal::ZERO {
            return Some(raw.normalize());
        }
        let ticks = (raw / self.tick_size).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        Some((ticks * self.tick_size).normalize())
    }

    pub fn meets_min_notional(&self, quantity: Decimal, price: f64) -> bool {
        match Decimal::from_f64(price) {
            Some(p) => quantity * p >= self.min_notional,
            None => false,
        }
    }
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            step_size: Decimal::new(1, 8),
            min_qty: Decimal::ZERO,
            tick_size: Decimal::new(1, 8),
            min_notional: Decimal::ZERO,
        }
    }
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
