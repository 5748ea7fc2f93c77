use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::models::{
    Candle, OpenOrder, OrderFill, OrderRequest, ProtectiveOrderRequest, ProtectiveOrders,
    ProtectiveStatus, SymbolFilters, Ticker24h,
};

/// Spot exchange capability consumed by the engine
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Most recent `limit` candles, oldest first
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// 24h change and top of book, used to screen symbols before scoring
    async fn get_ticker_24h(&self, symbol: &str) -> Result<Ticker24h, ExchangeError>;

    /// Market order
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill, ExchangeError>;

    /// Look up an order by the client id it was submitted with. `Ok(None)`
    /// means the exchange never accepted it.
    async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderFill>, ExchangeError>;

    /// Take-profit + stop-loss pair (OCO) protecting a long position
    async fn place_protective_orders(
        &self,
        request: &ProtectiveOrderRequest,
    ) -> Result<ProtectiveOrders, ExchangeError>;

    /// Whether a protective pair is still working, and which leg executed if not
    async fn get_protective_status(
        &self,
        symbol: &str,
        order_list_id: &str,
    ) -> Result<ProtectiveStatus, ExchangeError>;

    /// Cancel both legs of a protective pair. `NotFound` means the pair is no
    /// longer open (typically one leg already filled).
    async fn cancel_protective_orders(
        &self,
        symbol: &str,
        order_list_id: &str,
    ) -> Result<(), ExchangeError>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn get_free_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    fn name(&self) -> &str;
}
