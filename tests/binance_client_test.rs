use std::str::FromStr;
use std::time::Duration;

use mockito::{Matcher, Server};
use rust_decimal::Decimal;

use scalpbot::error::ExchangeError;
use scalpbot::models::{OrderRequest, OrderSide, ProtectiveLeg, ProtectiveOrderRequest, ProtectiveStatus};
use scalpbot::{BinanceClient, Exchange};
use tokio_test::assert_ok;

fn signed_client(server: &Server) -> BinanceClient {
    BinanceClient::new("test-key", "test-secret", Some(server.url()), Duration::from_secs(5), 6_000).unwrap()
}

fn public_client(server: &Server) -> BinanceClient {
    BinanceClient::public(Some(server.url()), Duration::from_secs(5), 6_000).unwrap()
}

fn signed_query() -> Matcher {
    Matcher::AllOf(vec![
        Matcher::Regex("timestamp=\\d+".into()),
        Matcher::Regex("recvWindow=5000".into()),
        Matcher::Regex("signature=[0-9a-f]{64}".into()),
    ])
}

#[tokio::test]
async fn test_get_candles_parses_klines() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v3/klines")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDC".into()),
            Matcher::UrlEncoded("interval".into(), "1m".into()),
            Matcher::UrlEncoded("limit".into(), "2".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"[
                [1700000000000,"100.0","101.0","99.0","100.5","10.0",1700000059999,"1005.0",12,"5.0","502.5","0"],
                [1700000060000,"100.5","102.0","100.0","101.5","20.0",1700000119999,"2030.0",20,"9.0","913.5","0"]
            ]"#,
        )
        .create_async()
        .await;

    let candles = assert_ok!(public_client(&server).get_candles("BTCUSDC", "1m", 2).await);
    mock.assert_async().await;

    assert_eq!(candles.len(), 2);
    assert_eq!(candles[0].open_time.timestamp_millis(), 1_700_000_000_000);
    assert_eq!(candles[1].close, 101.5);
    assert_eq!(candles[1].quote_volume, 2030.0);
}

#[tokio::test]
async fn test_get_current_price() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/ticker/price")
        .match_query(Matcher::UrlEncoded("symbol".into(), "ETHUSDC".into()))
        .with_status(200)
        .with_body(r#"{"symbol":"ETHUSDC","price":"3012.45000000"}"#)
        .create_async()
        .await;

    let price = assert_ok!(public_client(&server).get_current_price("ETHUSDC").await);
    assert_eq!(price, 3012.45);
}

#[tokio::test]
async fn test_market_order_reports_average_fill_price() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v3/order")
        .match_header("X-MBX-APIKEY", "test-key")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDC".into()),
            Matcher::UrlEncoded("side".into(), "BUY".into()),
            Matcher::UrlEncoded("type".into(), "MARKET".into()),
            Matcher::UrlEncoded("quantity".into(), "0.005".into()),
            Matcher::UrlEncoded("newClientOrderId".into(), "sb-test".into()),
            signed_query(),
        ]))
        .with_status(200)
        .with_body(r#"{"symbol":"BTCUSDC","orderId":42,"executedQty":"0.00500000","cummulativeQuoteQty":"300.50000000","status":"FILLED"}"#)
        .create_async()
        .await;

    let request = OrderRequest {
        symbol: "BTCUSDC".into(),
        side: OrderSide::Buy,
        quantity: Decimal::from_str("0.005").unwrap(),
        client_order_id: "sb-test".into(),
    };
    let fill = assert_ok!(signed_client(&server).place_order(&request).await);
    mock.assert_async().await;

    assert_eq!(fill.order_id, "42");
    assert_eq!(fill.executed_qty, 0.005);
    assert!((fill.avg_price - 60_100.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_get_order_by_client_id() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/order")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDC".into()),
            Matcher::UrlEncoded("origClientOrderId".into(), "sb-lost".into()),
            signed_query(),
        ]))
        .with_status(200)
        .with_body(r#"{"symbol":"BTCUSDC","orderId":42,"status":"FILLED","type":"MARKET","executedQty":"0.00500000","cummulativeQuoteQty":"300.50000000"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/api/v3/order")
        .match_query(Matcher::UrlEncoded("origClientOrderId".into(), "sb-never".into()))
        .with_status(400)
        .with_body(r#"{"code":-2013,"msg":"Order does not exist."}"#)
        .create_async()
        .await;

    let client = signed_client(&server);
    let fill = assert_ok!(client.get_order("BTCUSDC", "sb-lost").await).unwrap();
    assert_eq!(fill.order_id, "42");
    assert!((fill.avg_price - 60_100.0).abs() < 1e-6);

    assert_eq!(assert_ok!(client.get_order("BTCUSDC", "sb-never").await), None);
}

#[tokio::test]
async fn test_protective_status_reports_executed_leg() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/orderList")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("orderListId".into(), "7".into()),
            signed_query(),
        ]))
        .with_status(200)
        .with_body(r#"{"orderListId":7,"listOrderStatus":"ALL_DONE","orders":[{"symbol":"SOLUSDC","orderId":11},{"symbol":"SOLUSDC","orderId":12}]}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/api/v3/order")
        .match_query(Matcher::UrlEncoded("orderId".into(), "11".into()))
        .with_status(200)
        .with_body(r#"{"orderId":11,"status":"EXPIRED","type":"STOP_LOSS_LIMIT","executedQty":"0.00","cummulativeQuoteQty":"0.00"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/api/v3/order")
        .match_query(Matcher::UrlEncoded("orderId".into(), "12".into()))
        .with_status(200)
        .with_body(r#"{"orderId":12,"status":"FILLED","type":"LIMIT_MAKER","executedQty":"5.00","cummulativeQuoteQty":"504.50"}"#)
        .create_async()
        .await;

    let status = assert_ok!(signed_client(&server).get_protective_status("SOLUSDC", "7").await);
    assert_eq!(
        status,
        ProtectiveStatus::Filled {
            leg: ProtectiveLeg::TakeProfit,
            price: 100.9
        }
    );
}

#[tokio::test]
async fn test_working_pair_is_open() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v3/orderList")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"orderListId":7,"listOrderStatus":"EXECUTING","orders":[{"symbol":"SOLUSDC","orderId":11},{"symbol":"SOLUSDC","orderId":12}]}"#)
        .create_async()
        .await;

    let status = assert_ok!(signed_client(&server).get_protective_status("SOLUSDC", "7").await);
    mock.assert_async().await;
    assert_eq!(status, ProtectiveStatus::Open);
}

#[tokio::test]
async fn test_ticker_24h_parses_book_and_change() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/ticker/24hr")
        .match_query(Matcher::UrlEncoded("symbol".into(), "SOLUSDC".into()))
        .with_status(200)
        .with_body(r#"{"symbol":"SOLUSDC","priceChangePercent":"-1.250","bidPrice":"100.00","askPrice":"100.10","quoteVolume":"5000000.0"}"#)
        .create_async()
        .await;

    let ticker = assert_ok!(public_client(&server).get_ticker_24h("SOLUSDC").await);
    assert_eq!(ticker.price_change_pct, -1.25);
    assert!((ticker.spread_pct().unwrap() - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_insufficient_balance_maps_to_insufficient_funds() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v3/order")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#)
        .create_async()
        .await;

    let request = OrderRequest {
        symbol: "BTCUSDC".into(),
        side: OrderSide::Buy,
        quantity: Decimal::ONE,
        client_order_id: "sb-broke".into(),
    };
    let err = signed_client(&server).place_order(&request).await.unwrap_err();
    assert!(matches!(err, ExchangeError::InsufficientFunds(_)), "got {:?}", err);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_place_protective_orders_sends_oco() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v3/order/oco")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("side".into(), "SELL".into()),
            Matcher::UrlEncoded("price".into(), "100.9".into()),
            Matcher::UrlEncoded("stopPrice".into(), "99.6".into()),
            Matcher::UrlEncoded("stopLimitPrice".into(), "99.5".into()),
            Matcher::UrlEncoded("stopLimitTimeInForce".into(), "GTC".into()),
            signed_query(),
        ]))
        .with_status(200)
        .with_body(r#"{"orderListId":7,"contingencyType":"OCO","orders":[{"symbol":"SOLUSDC","orderId":11},{"symbol":"SOLUSDC","orderId":12}]}"#)
        .create_async()
        .await;

    let request = ProtectiveOrderRequest {
        symbol: "SOLUSDC".into(),
        quantity: Decimal::from(5),
        take_profit_price: Decimal::from_str("100.9").unwrap(),
        stop_loss_price: Decimal::from_str("99.6").unwrap(),
        stop_limit_price: Decimal::from_str("99.5").unwrap(),
        list_client_id: "sb-oco".into(),
    };
    let orders = assert_ok!(signed_client(&server).place_protective_orders(&request).await);
    mock.assert_async().await;

    assert_eq!(orders.order_list_id, "7");
    assert_eq!(orders.order_ids, vec!["11".to_string(), "12".to_string()]);
}

#[tokio::test]
async fn test_cancel_of_filled_pair_is_not_found() {
    let mut server = Server::new_async().await;
    server
        .mock("DELETE", "/api/v3/orderList")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("orderListId".into(), "7".into()),
            signed_query(),
        ]))
        .with_status(400)
        .with_body(r#"{"code":-2011,"msg":"Unknown order sent."}"#)
        .create_async()
        .await;

    let err = signed_client(&server)
        .cancel_protective_orders("SOLUSDC", "7")
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::NotFound(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/ticker/price")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("Retry-After", "3")
        .with_body(r#"{"code":-1003,"msg":"Too many requests."}"#)
        .create_async()
        .await;

    let err = public_client(&server).get_current_price("BTCUSDC").await.unwrap_err();
    match err {
        ExchangeError::RateLimited { retry_after } => assert_eq!(retry_after, Some(Duration::from_secs(3))),
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/klines")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("Service Unavailable")
        .create_async()
        .await;

    let err = public_client(&server).get_candles("BTCUSDC", "1m", 10).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Network(_)), "got {:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_free_balance_and_open_orders() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/account")
        .match_query(signed_query())
        .with_status(200)
        .with_body(r#"{"balances":[{"asset":"BTC","free":"0.1","locked":"0"},{"asset":"USDC","free":"1234.56","locked":"10"}]}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/api/v3/openOrders")
        .match_query(signed_query())
        .with_status(200)
        .with_body(
            r#"[
                {"symbol":"SOLUSDC","orderId":11,"orderListId":7,"side":"SELL","price":"100.90","origQty":"5.00"},
                {"symbol":"BTCUSDC","orderId":20,"orderListId":-1,"side":"BUY","price":"60000.00","origQty":"0.01"}
            ]"#,
        )
        .create_async()
        .await;

    let client = signed_client(&server);
    assert_eq!(client.get_free_balance("USDC").await.unwrap(), 1234.56);
    assert_eq!(client.get_free_balance("DOGE").await.unwrap(), 0.0);

    let orders = assert_ok!(client.get_open_orders(None).await);
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].order_list_id.as_deref(), Some("7"));
    assert_eq!(orders[0].side, OrderSide::Sell);
    assert_eq!(orders[1].order_list_id, None);
}

#[tokio::test]
async fn test_symbol_filters_are_cached() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v3/exchangeInfo")
        .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDC".into()))
        .with_status(200)
        .with_body(
            r#"{"symbols":[{"symbol":"BTCUSDC","filters":[
                {"filterType":"PRICE_FILTER","minPrice":"0.01","maxPrice":"1000000","tickSize":"0.01000000"},
                {"filterType":"LOT_SIZE","minQty":"0.00001000","maxQty":"9000","stepSize":"0.00001000"},
                {"filterType":"NOTIONAL","minNotional":"5.00000000"}
            ]}]}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let client = public_client(&server);
    let first = client.get_symbol_filters("BTCUSDC").await.unwrap();
    let second = client.get_symbol_filters("BTCUSDC").await.unwrap();
    mock.assert_async().await;

    assert_eq!(first, second);
    assert_eq!(first.tick_size, Decimal::from_str("0.01").unwrap());
    assert_eq!(first.step_size, Decimal::from_str("0.00001").unwrap());
    assert_eq!(first.min_notional, Decimal::from(5));
}

#[tokio::test]
async fn test_signed_call_without_credentials_is_refused() {
    let server = Server::new_async().await;
    let err = public_client(&server).get_free_balance("USDC").await.unwrap_err();
    assert!(matches!(err, ExchangeError::OrderRejected(_)), "got {:?}", err);
}
