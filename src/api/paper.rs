use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;

use super::exchange::Exchange;
use crate::error::ExchangeError;
use crate::models::{
    Candle, OpenOrder, OrderFill, OrderRequest, OrderSide, ProtectiveOrderRequest,
    ProtectiveOrders, ProtectiveStatus, SymbolFilters, Ticker24h,
};

/// Fills remembered for `get_order` lookups
const FILL_HISTORY: usize = 1_000;

struct Book {
    quote_balance: f64,
    holdings: HashMap<String, f64>,
    fills: HashMap<String, OrderFill>, // by client order id
    fill_order: VecDeque<String>,
    protective: HashMap<String, ProtectiveOrderRequest>, // by order list id
    next_id: u64,
}

impl Book {
    fn remember_fill(&mut self, client_order_id: &str, fill: OrderFill) {
        self.fills.insert(client_order_id.to_string(), fill);
        self.fill_order.push_back(client_order_id.to_string());
        while self.fill_order.len() > FILL_HISTORY {
            if let Some(oldest) = self.fill_order.pop_front() {
                self.fills.remove(&oldest);
            }
        }
    }
}

/// Simulated execution on top of a real market-data source.
///
/// Market orders fill at the current price against an in-memory balance.
/// Protective pairs are recorded and cancellable but never fill on their own,
/// so exits in paper mode always come from the supervisor's own checks.
pub struct PaperExchange {
    market: Arc<dyn Exchange>,
    quote_asset: String,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(market: Arc<dyn Exchange>, quote_asset: impl Into<String>, starting_balance: f64) -> Self {
        Self {
            market,
            quote_asset: quote_asset.into(),
            book: Mutex::new(Book {
                quote_balance: starting_balance,
                holdings: HashMap::new(),
                fills: HashMap::new(),
                fill_order: VecDeque::new(),
                protective: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn quote_balance(&self) -> f64 {
        self.book().quote_balance
    }
}

fn base_asset<'a>(symbol: &'a str, quote: &str) -> &'a str {
    symbol.strip_suffix(quote).unwrap_or(symbol)
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        self.market.get_candles(symbol, interval, limit).await
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.market.get_current_price(symbol).await
    }

    async fn get_ticker_24h(&self, symbol: &str) -> Result<Ticker24h, ExchangeError> {
        self.market.get_ticker_24h(symbol).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill, ExchangeError> {
        let price = self.market.get_current_price(&request.symbol).await?;
        let quantity = request
            .quantity
            .to_f64()
            .ok_or_else(|| ExchangeError::OrderRejected(format!("invalid quantity {}", request.quantity)))?;
        if quantity <= 0.0 {
            return Err(ExchangeError::OrderRejected("quantity must be positive".into()));
        }
        let notional = quantity * price;

        let mut book = self.book();
        match request.side {
            OrderSide::Buy => {
                if notional > book.quote_balance {
                    return Err(ExchangeError::InsufficientFunds(format!(
                        "need {:.2} {}, have {:.2}",
                        notional, self.quote_asset, book.quote_balance
                    )));
                }
                book.quote_balance -= notional;
                *book.holdings.entry(request.symbol.clone()).or_insert(0.0) += quantity;
            }
            OrderSide::Sell => {
                let held = book.holdings.get(&request.symbol).copied().unwrap_or(0.0);
                // tolerate float dust from repeated fills
                if quantity > held * (1.0 + 1e-9) {
                    return Err(ExchangeError::InsufficientFunds(format!(
                        "need {} {}, have {}",
                        quantity, request.symbol, held
                    )));
                }
                book.holdings.insert(request.symbol.clone(), (held - quantity).max(0.0));
                book.quote_balance += notional;
            }
        }

        let order_id = format!("paper-{}", book.next_id);
        book.next_id += 1;

        let fill = OrderFill {
            order_id,
            avg_price: price,
            executed_qty: quantity,
        };
        book.remember_fill(&request.client_order_id, fill.clone());

        tracing::info!(
            "📝 Paper {} {} {} @ ${:.4}",
            request.side.as_str(),
            quantity,
            request.symbol,
            price
        );
        Ok(fill)
    }

    async fn place_protective_orders(
        &self,
        request: &ProtectiveOrderRequest,
    ) -> Result<ProtectiveOrders, ExchangeError> {
        if request.take_profit_price <= request.stop_loss_price {
            return Err(ExchangeError::OrderRejected(
                "take-profit must be above stop-loss".into(),
            ));
        }

        let mut book = self.book();
        let list_id = format!("paper-oco-{}", book.next_id);
        let order_ids = vec![
            format!("paper-{}", book.next_id + 1),
            format!("paper-{}", book.next_id + 2),
        ];
        book.next_id += 3;
        book.protective.insert(list_id.clone(), request.clone());

        Ok(ProtectiveOrders {
            order_list_id: list_id,
            order_ids,
        })
    }

    async fn get_order(&self, _symbol: &str, client_order_id: &str) -> Result<Option<OrderFill>, ExchangeError> {
        Ok(self.book().fills.get(client_order_id).cloned())
    }

    async fn get_protective_status(&self, _symbol: &str, order_list_id: &str) -> Result<ProtectiveStatus, ExchangeError> {
        if self.book().protective.contains_key(order_list_id) {
            Ok(ProtectiveStatus::Open)
        } else {
            Err(ExchangeError::NotFound(format!("order list {}", order_list_id)))
        }
    }

    async fn cancel_protective_orders(&self, _symbol: &str, order_list_id: &str) -> Result<(), ExchangeError> {
        match self.book().protective.remove(order_list_id) {
            Some(_) => Ok(()),
            None => Err(ExchangeError::NotFound(format!("order list {}", order_list_id))),
        }
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, ExchangeError> {
        let book = self.book();
        let mut orders = Vec::new();

        for (list_id, req) in book.protective.iter() {
            if symbol.map_or(false, |s| s != req.symbol) {
                continue;
            }
            let quantity = req.quantity.to_f64().unwrap_or(0.0);
            for price in [req.take_profit_price, req.stop_loss_price] {
                orders.push(OpenOrder {
                    order_id: format!("{}-{}", list_id, price),
                    symbol: req.symbol.clone(),
                    side: OrderSide::Sell,
                    price: price.to_f64().unwrap_or(0.0),
                    quantity,
                    order_list_id: Some(list_id.clone()),
                });
            }
        }

        Ok(orders)
    }

    async fn get_free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let book = self.book();
        if asset == self.quote_asset {
            return Ok(book.quote_balance);
        }

        Ok(book
            .holdings
            .iter()
            .filter(|(symbol, _)| base_asset(symbol, &self.quote_asset) == asset)
            .map(|(_, qty)| *qty)
            .sum())
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.market.get_symbol_filters(symbol).await
    }

    fn name(&self) -> &str {
        "paper"
    }
}
