use std::collections::HashMap;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use super::exchange::Exchange;
use crate::error::ExchangeError;
use crate::models::{
    Candle, OpenOrder, OrderFill, OrderRequest, OrderSide, ProtectiveLeg, ProtectiveOrderRequest,
    ProtectiveOrders, ProtectiveStatus, SymbolFilters, Ticker24h,
};

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const RECV_WINDOW: u64 = 5000;

// Binance error codes
const CODE_INSUFFICIENT_BALANCE: i64 = -2010;
const CODE_CANCEL_REJECTED: i64 = -2011;
const CODE_NO_SUCH_ORDER: i64 = -2013;

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    executed_qty: String,
    cummulative_quote_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24hResponse {
    symbol: String,
    price_change_percent: String,
    bid_price: String,
    ask_price: String,
    quote_volume: String,
}

/// `GET /api/v3/order` body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDetail {
    order_id: i64,
    status: String,
    #[serde(rename = "type")]
    order_type: String,
    executed_qty: String,
    cummulative_quote_qty: String,
}

impl OrderDetail {
    fn fill(&self) -> Result<OrderFill, ExchangeError> {
        let executed_qty = parse_f64(&self.executed_qty)?;
        let quote_qty = parse_f64(&self.cummulative_quote_qty)?;
        Ok(OrderFill {
            order_id: self.order_id.to_string(),
            avg_price: if executed_qty > 0.0 { quote_qty / executed_qty } else { 0.0 },
            executed_qty,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderListResponse {
    list_order_status: String,
    orders: Vec<OcoOrderRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OcoOrderRef {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OcoResponse {
    order_list_id: i64,
    orders: Vec<OcoOrderRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderResponse {
    symbol: String,
    order_id: i64,
    order_list_id: i64,
    side: String,
    price: String,
    orig_qty: String,
}

#[derive(Debug, Deserialize)]
struct AccountBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<AccountBalance>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

/// Binance spot REST client with HMAC-SHA256 request signing.
///
/// The secret key is never logged. Requests are paced by a client-side rate
/// limiter; exchange filters are cached per symbol after the first lookup.
pub struct BinanceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    secret: Option<String>,
    timeout: Duration,
    rate_limiter: Arc<BinanceRateLimiter>,
    filters: Mutex<HashMap<String, SymbolFilters>>,
}

impl BinanceClient {
    /// Public market-data client (no credentials)
    pub fn public(base_url: Option<String>, timeout: Duration, requests_per_minute: u32) -> anyhow::Result<Self> {
        Self::build(base_url, None, None, timeout, requests_per_minute)
    }

    /// Client able to place signed requests
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
        requests_per_minute: u32,
    ) -> anyhow::Result<Self> {
        Self::build(
            base_url,
            Some(api_key.into()),
            Some(secret.into()),
            timeout,
            requests_per_minute,
        )
    }

    fn build(
        base_url: Option<String>,
        api_key: Option<String>,
        secret: Option<String>,
        timeout: Duration,
        requests_per_minute: u32,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        let rpm = NonZeroU32::new(requests_per_minute).context("requests_per_minute must be positive")?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        tracing::debug!("BinanceClient initialised (base_url={})", base_url);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            secret,
            timeout,
            rate_limiter,
            filters: Mutex::new(HashMap::new()),
        })
    }

    /// HMAC-SHA256 hex signature of `query`
    pub fn sign(secret: &str, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::InvalidResponse(format!("invalid secret key: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Append timestamp, recvWindow and signature to `params`
    fn signed_query(&self, params: &str) -> Result<String, ExchangeError> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| ExchangeError::OrderRejected("signed endpoint needs API credentials".into()))?;

        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = Self::sign(secret, &base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    async fn public_get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &str) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.send(Method::GET, url, false).await
    }

    async fn signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<T, ExchangeError> {
        let qs = self.signed_query(params)?;
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let is_order = path.contains("order");
        self.send(method, url, is_order).await
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        is_order: bool,
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let mut request = self.client.request(method, &url);
        if let Some(key) = &self.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(map_error(status, &body, retry_after, is_order));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::InvalidResponse(format!("{}: {}", e, truncate(&body))))
    }

    fn transport_error(&self, e: reqwest::Error) -> ExchangeError {
        if e.is_timeout() {
            ExchangeError::Timeout(self.timeout)
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

/// Translate an HTTP error response into the exchange error taxonomy
fn map_error(status: StatusCode, body: &str, retry_after: Option<Duration>, is_order: bool) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited { retry_after };
    }

    let api_error: Option<ApiError> = serde_json::from_str(body).ok();
    let message = api_error
        .as_ref()
        .map(|e| format!("{} (code {})", e.msg, e.code))
        .unwrap_or_else(|| format!("HTTP {}: {}", status, truncate(body)));

    if let Some(err) = &api_error {
        match err.code {
            CODE_INSUFFICIENT_BALANCE => return ExchangeError::InsufficientFunds(message),
            CODE_CANCEL_REJECTED | CODE_NO_SUCH_ORDER => return ExchangeError::NotFound(message),
            _ => {}
        }
    }

    if status.is_server_error() {
        return ExchangeError::Network(message);
    }
    if status == StatusCode::NOT_FOUND {
        return ExchangeError::NotFound(message);
    }
    if is_order && status.is_client_error() {
        return ExchangeError::OrderRejected(message);
    }
    ExchangeError::InvalidResponse(message)
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn parse_f64(s: &str) -> Result<f64, ExchangeError> {
    s.parse::<f64>()
        .map_err(|_| ExchangeError::InvalidResponse(format!("failed to parse '{}' as number", s)))
}

/// Binance numbers arrive as strings, sometimes as JSON numbers
fn value_f64(val: &serde_json::Value) -> Result<f64, ExchangeError> {
    if let Some(s) = val.as_str() {
        parse_f64(s)
    } else {
        val.as_f64()
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("expected string or number, got: {}", val)))
    }
}

fn value_decimal(val: &serde_json::Value) -> Option<Decimal> {
    val.as_str().and_then(|s| Decimal::from_str(s).ok())
}

/// Parse kline rows: [openTime, open, high, low, close, volume, closeTime, quoteVolume, ...]
pub fn parse_klines(rows: &[Vec<serde_json::Value>]) -> Result<Vec<Candle>, ExchangeError> {
    let mut candles = Vec::with_capacity(rows.len());

    for row in rows {
        if row.len() < 8 {
            tracing::warn!("skipping malformed kline entry with {} elements", row.len());
            continue;
        }

        let open_ms = row[0]
            .as_i64()
            .ok_or_else(|| ExchangeError::InvalidResponse("kline open time is not an integer".into()))?;
        let open_time = Utc
            .timestamp_millis_opt(open_ms)
            .single()
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("invalid kline open time {}", open_ms)))?;

        candles.push(Candle {
            open_time,
            open: value_f64(&row[1])?,
            high: value_f64(&row[2])?,
            low: value_f64(&row[3])?,
            close: value_f64(&row[4])?,
            volume: value_f64(&row[5])?,
            quote_volume: value_f64(&row[7])?,
        });
    }

    Ok(candles)
}

/// Extract LOT_SIZE, PRICE_FILTER and (MIN_)NOTIONAL constraints
pub fn parse_filters(filters: &[serde_json::Value]) -> SymbolFilters {
    let mut parsed = SymbolFilters::default();

    for filter in filters {
        match filter["filterType"].as_str() {
            Some("LOT_SIZE") => {
                if let Some(step) = value_decimal(&filter["stepSize"]) {
                    parsed.step_size = step;
                }
                if let Some(min) = value_decimal(&filter["minQty"]) {
                    parsed.min_qty = min;
                }
            }
            Some("PRICE_FILTER") => {
                if let Some(tick) = value_decimal(&filter["tickSize"]) {
                    parsed.tick_size = tick;
                }
            }
            Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                if let Some(min) = value_decimal(&filter["minNotional"]) {
                    parsed.min_notional = min;
                }
            }
            _ => {}
        }
    }

    parsed
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!("symbol={}&interval={}&limit={}", symbol, interval, limit);
        let rows: Vec<Vec<serde_json::Value>> = self.public_get("/api/v3/klines", &query).await?;
        let candles = parse_klines(&rows)?;
        tracing::debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker: TickerPrice = self
            .public_get("/api/v3/ticker/price", &format!("symbol={}", symbol))
            .await?;
        parse_f64(&ticker.price)
    }

    async fn get_ticker_24h(&self, symbol: &str) -> Result<Ticker24h, ExchangeError> {
        let ticker: Ticker24hResponse = self
            .public_get("/api/v3/ticker/24hr", &format!("symbol={}", symbol))
            .await?;

        Ok(Ticker24h {
            symbol: ticker.symbol,
            bid: parse_f64(&ticker.bid_price)?,
            ask: parse_f64(&ticker.ask_price)?,
            price_change_pct: parse_f64(&ticker.price_change_percent)?,
            quote_volume: parse_f64(&ticker.quote_volume)?,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill, ExchangeError> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&newClientOrderId={}",
            request.symbol,
            request.side.as_str(),
            request.quantity,
            request.client_order_id
        );

        let response: OrderResponse = self.signed(Method::POST, "/api/v3/order", &params).await?;

        let executed_qty = parse_f64(&response.executed_qty)?;
        let quote_qty = parse_f64(&response.cummulative_quote_qty)?;
        if executed_qty <= 0.0 {
            return Err(ExchangeError::OrderRejected(format!(
                "order {} executed no quantity",
                response.order_id
            )));
        }

        tracing::debug!(
            symbol = %request.symbol,
            side = request.side.as_str(),
            executed_qty,
            "market order filled"
        );

        Ok(OrderFill {
            order_id: response.order_id.to_string(),
            avg_price: quote_qty / executed_qty,
            executed_qty,
        })
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> Result<Option<OrderFill>, ExchangeError> {
        let params = format!("symbol={}&origClientOrderId={}", symbol, client_order_id);
        match self.signed::<OrderDetail>(Method::GET, "/api/v3/order", &params).await {
            Ok(order) => {
                tracing::debug!(symbol, client_order_id, status = %order.status, "order looked up");
                order.fill().map(Some)
            }
            Err(ExchangeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn place_protective_orders(
        &self,
        request: &ProtectiveOrderRequest,
    ) -> Result<ProtectiveOrders, ExchangeError> {
        let params = format!(
            "symbol={}&side=SELL&quantity={}&price={}&stopPrice={}&stopLimitPrice={}&stopLimitTimeInForce=GTC&listClientOrderId={}",
            request.symbol,
            request.quantity,
            request.take_profit_price,
            request.stop_loss_price,
            request.stop_limit_price,
            request.list_client_id
        );

        let response: OcoResponse = self.signed(Method::POST, "/api/v3/order/oco", &params).await?;

        Ok(ProtectiveOrders {
            order_list_id: response.order_list_id.to_string(),
            order_ids: response.orders.iter().map(|o| o.order_id.to_string()).collect(),
        })
    }

    async fn get_protective_status(&self, symbol: &str, order_list_id: &str) -> Result<ProtectiveStatus, ExchangeError> {
        let params = format!("orderListId={}", order_list_id);
        let list: OrderListResponse = self.signed(Method::GET, "/api/v3/orderList", &params).await?;
        if list.list_order_status == "EXECUTING" {
            return Ok(ProtectiveStatus::Open);
        }

        for leg in &list.orders {
            let params = format!("symbol={}&orderId={}", symbol, leg.order_id);
            let order: OrderDetail = self.signed(Method::GET, "/api/v3/order", &params).await?;
            let fill = order.fill()?;
            if fill.executed_qty <= 0.0 {
                continue;
            }

            // The stop leg is STOP_LOSS_LIMIT, the take-profit leg LIMIT_MAKER
            let leg = if order.order_type.starts_with("STOP_LOSS") {
                ProtectiveLeg::StopLoss
            } else {
                ProtectiveLeg::TakeProfit
            };
            return Ok(ProtectiveStatus::Filled {
                leg,
                price: fill.avg_price,
            });
        }

        Ok(ProtectiveStatus::Cancelled)
    }

    async fn cancel_protective_orders(&self, symbol: &str, order_list_id: &str) -> Result<(), ExchangeError> {
        let params = format!("symbol={}&orderListId={}", symbol, order_list_id);
        let _: serde_json::Value = self.signed(Method::DELETE, "/api/v3/orderList", &params).await?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, ExchangeError> {
        let params = symbol.map(|s| format!("symbol={}", s)).unwrap_or_default();
        let orders: Vec<OpenOrderResponse> = self.signed(Method::GET, "/api/v3/openOrders", &params).await?;

        orders
            .into_iter()
            .map(|o| {
                Ok(OpenOrder {
                    order_id: o.order_id.to_string(),
                    symbol: o.symbol,
                    side: if o.side == "BUY" { OrderSide::Buy } else { OrderSide::Sell },
                    price: parse_f64(&o.price)?,
                    quantity: parse_f64(&o.orig_qty)?,
                    order_list_id: (o.order_list_id >= 0).then(|| o.order_list_id.to_string()),
                })
            })
            .collect()
    }

    async fn get_free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let account: AccountResponse = self.signed(Method::GET, "/api/v3/account", "").await?;

        match account.balances.iter().find(|b| b.asset == asset) {
            Some(balance) => parse_f64(&balance.free),
            None => {
                tracing::warn!(asset, "asset not found in balances, treating as 0");
                Ok(0.0)
            }
        }
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let cached = self
            .filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned();
        if let Some(filters) = cached {
            return Ok(filters);
        }

        let info: ExchangeInfo = self
            .public_get("/api/v3/exchangeInfo", &format!("symbol={}", symbol))
            .await?;
        let entry = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ExchangeError::NotFound(format!("symbol {} not listed", symbol)))?;

        let filters = parse_filters(&entry.filters);
        self.filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), filters.clone());
        Ok(filters)
    }

    fn name(&self) -> &str {
        "binance"
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_known_vector() {
        // Example from the Binance API documentation
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            BinanceClient::sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_parse_klines() {
        let rows = vec![vec![
            json!(1_700_000_000_000i64),
            json!("100.0"),
            json!("101.5"),
            json!("99.5"),
            json!("100.5"),
            json!("12.0"),
            json!(1_700_000_059_999i64),
            json!("1206.0"),
            json!(42),
        ]];
        let candles = parse_klines(&rows).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, 101.5);
        assert_eq!(candles[0].quote_volume, 1206.0);
        assert_eq!(candles[0].open_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_filters() {
        let filters = vec![
            json!({"filterType": "PRICE_FILTER", "tickSize": "0.01000000"}),
            json!({"filterType": "LOT_SIZE", "stepSize": "0.00001000", "minQty": "0.00001000"}),
            json!({"filterType": "NOTIONAL", "minNotional": "5.00000000"}),
        ];
        let parsed = parse_filters(&filters);
        assert_eq!(parsed.tick_size, Decimal::from_str("0.01").unwrap());
        assert_eq!(parsed.step_size, Decimal::from_str("0.00001").unwrap());
        assert_eq!(parsed.min_notional, Decimal::from_str("5").unwrap());
    }

    #[test]
    fn test_error_mapping() {
        let funds = map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2010,"msg":"Account has insufficient balance"}"#,
            None,
            true,
        );
        assert!(matches!(funds, ExchangeError::InsufficientFunds(_)));

        let missing = map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2011,"msg":"Unknown order sent."}"#,
            None,
            true,
        );
        assert!(matches!(missing, ExchangeError::NotFound(_)));

        let rejected = map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1013,"msg":"Filter failure: LOT_SIZE"}"#,
            None,
            true,
        );
        assert!(matches!(rejected, ExchangeError::OrderRejected(_)));

        let limited = map_error(StatusCode::TOO_MANY_REQUESTS, "", Some(Duration::from_secs(3)), false);
        assert_eq!(
            limited,
            ExchangeError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );

        let server = map_error(StatusCode::BAD_GATEWAY, "oops", None, false);
        assert!(server.is_retryable());
    }
}
