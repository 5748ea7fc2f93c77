#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use scalpbot::engine::{EngineSettings, Orchestrator};
use scalpbot::error::{ExchangeError, IndicatorError};
use scalpbot::events::{BotEvent, EventPublisher};
use scalpbot::execution::{
    Executor, ExitRules, MarketFeed, Portfolio, PositionSupervisor, RetryPolicy, SizingRules,
};
use scalpbot::indicators::IndicatorSnapshot;
use scalpbot::models::{
    Candle, OpenOrder, OrderFill, OrderRequest, OrderSide, ProtectiveLeg, ProtectiveOrderRequest,
    ProtectiveOrders, ProtectiveStatus, SymbolFilters, Ticker24h,
};
use scalpbot::persistence::{BotStateSnapshot, StateStore};
use scalpbot::risk::{RiskGovernor, RiskLimits, RiskState};
use scalpbot::strategy::{EntryConditions, PairScreen, SignalEvaluation, Strategy};
use scalpbot::Exchange;

/// In-memory exchange whose prices, candles and failures the test controls
pub struct ScriptedExchange {
    prices: Mutex<HashMap<String, f64>>,
    broken_symbols: Mutex<HashSet<String>>,
    slow_symbols: Mutex<HashMap<String, Duration>>,
    candle_caps: Mutex<HashMap<String, usize>>,
    candle_closes: Mutex<HashMap<String, Vec<f64>>>,
    spreads: Mutex<HashMap<String, f64>>,
    pub reject_protective: AtomicBool,
    /// Protective pairs are placed but the response never arrives
    pub lose_protective_responses: AtomicBool,
    /// Orders execute but their responses never arrive
    pub lose_responses: AtomicBool,
    /// Order lookups by client id fail
    pub fail_lookups: AtomicBool,
    /// The next N submissions fail in transit without reaching the book
    pub fail_in_transit: AtomicU32,
    rejection: Mutex<Option<ExchangeError>>,
    balance: Mutex<f64>,
    submissions: AtomicU32,
    orders: Mutex<Vec<OrderRequest>>,
    fills: Mutex<HashMap<String, OrderFill>>,
    protective: Mutex<HashMap<String, ProtectiveOrderRequest>>,
    finished: Mutex<HashMap<String, ProtectiveStatus>>,
    next_id: AtomicU64,
}

impl ScriptedExchange {
    pub fn new(balance: f64) -> Arc<Self> {
        Arc::new(Self {
            prices: Mutex::new(HashMap::new()),
            broken_symbols: Mutex::new(HashSet::new()),
            slow_symbols: Mutex::new(HashMap::new()),
            candle_caps: Mutex::new(HashMap::new()),
            candle_closes: Mutex::new(HashMap::new()),
            spreads: Mutex::new(HashMap::new()),
            reject_protective: AtomicBool::new(false),
            lose_protective_responses: AtomicBool::new(false),
            lose_responses: AtomicBool::new(false),
            fail_lookups: AtomicBool::new(false),
            fail_in_transit: AtomicU32::new(0),
            rejection: Mutex::new(None),
            balance: Mutex::new(balance),
            submissions: AtomicU32::new(0),
            orders: Mutex::new(Vec::new()),
            fills: Mutex::new(HashMap::new()),
            protective: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    /// Every market-data call for `symbol` fails with a network error
    pub fn break_symbol(&self, symbol: &str) {
        self.broken_symbols.lock().unwrap().insert(symbol.to_string());
    }

    /// Candle fetches for `symbol` take `delay`
    pub fn slow_symbol(&self, symbol: &str, delay: Duration) {
        self.slow_symbols.lock().unwrap().insert(symbol.to_string(), delay);
    }

    /// Serve at most `count` candles for `symbol`, as for a newly listed market
    pub fn cap_candles(&self, symbol: &str, count: usize) {
        self.candle_caps.lock().unwrap().insert(symbol.to_string(), count);
    }

    /// Serve these closes, oldest first, instead of a flat window
    pub fn set_closes(&self, symbol: &str, closes: Vec<f64>) {
        self.candle_closes.lock().unwrap().insert(symbol.to_string(), closes);
    }

    /// Quote an ask `pct` percent above the bid
    pub fn set_spread(&self, symbol: &str, pct: f64) {
        self.spreads.lock().unwrap().insert(symbol.to_string(), pct);
    }

    /// Refuse every market order with `error` until cleared with None
    pub fn reject_orders(&self, error: Option<ExchangeError>) {
        *self.rejection.lock().unwrap() = error;
    }

    /// Market orders sent, whether or not they executed
    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> Vec<(OrderSide, String)> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .map(|o| (o.side, o.symbol.clone()))
            .collect()
    }

    pub fn protective_count(&self) -> usize {
        self.protective.lock().unwrap().len()
    }

    /// One leg of `symbol`'s protective pair fills at its limit price
    pub fn fill_protective(&self, symbol: &str, leg: ProtectiveLeg) {
        for (list_id, req) in self.take_protective(symbol) {
            let price = match leg {
                ProtectiveLeg::TakeProfit => req.take_profit_price,
                ProtectiveLeg::StopLoss => req.stop_loss_price,
            };
            let price = price.to_f64().unwrap_or(0.0);
            *self.balance.lock().unwrap() += req.quantity.to_f64().unwrap_or(0.0) * price;
            self.finished
                .lock()
                .unwrap()
                .insert(list_id, ProtectiveStatus::Filled { leg, price });
        }
    }

    /// `symbol`'s protective pair is cancelled by hand, nothing executed
    pub fn drop_protective(&self, symbol: &str) {
        for (list_id, _) in self.take_protective(symbol) {
            self.finished.lock().unwrap().insert(list_id, ProtectiveStatus::Cancelled);
        }
    }

    fn take_protective(&self, symbol: &str) -> Vec<(String, ProtectiveOrderRequest)> {
        let mut protective = self.protective.lock().unwrap();
        let ids: Vec<String> = protective
            .iter()
            .filter(|(_, req)| req.symbol == symbol)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| protective.remove(&id).map(|req| (id, req)))
            .collect()
    }

    fn check_market(&self, symbol: &str) -> Result<f64, ExchangeError> {
        if self.broken_symbols.lock().unwrap().contains(symbol) {
            return Err(ExchangeError::Network(format!("{} feed unavailable", symbol)));
        }
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::NotFound(format!("no price for {}", symbol)))
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn get_candles(&self, symbol: &str, _interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let delay = self.slow_symbols.lock().unwrap().get(symbol).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let price = self.check_market(symbol)?;
        if let Some(closes) = self.candle_closes.lock().unwrap().get(symbol) {
            let start = closes.len().saturating_sub(limit);
            return Ok(candles_from_closes(&closes[start..], Utc::now()));
        }
        let cap = self.candle_caps.lock().unwrap().get(symbol).copied();
        let count = cap.map_or(limit, |cap| cap.min(limit));
        Ok(flat_candles(count, price, Utc::now()))
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.check_market(symbol)
    }

    async fn get_ticker_24h(&self, symbol: &str) -> Result<Ticker24h, ExchangeError> {
        let price = self.check_market(symbol)?;
        let spread = self.spreads.lock().unwrap().get(symbol).copied().unwrap_or(0.0);
        Ok(Ticker24h {
            symbol: symbol.to_string(),
            bid: price,
            ask: price * (1.0 + spread / 100.0),
            price_change_pct: 1.5,
            quote_volume: 1_000_000.0,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill, ExchangeError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.rejection.lock().unwrap().clone() {
            return Err(err);
        }
        let in_transit = self
            .fail_in_transit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if in_transit {
            return Err(ExchangeError::Network("connection reset".into()));
        }

        let price = self.check_market(&request.symbol)?;
        let qty = request.quantity.to_f64().unwrap_or(0.0);

        {
            let mut balance = self.balance.lock().unwrap();
            match request.side {
                OrderSide::Buy => {
                    if qty * price > *balance {
                        return Err(ExchangeError::InsufficientFunds("quote".into()));
                    }
                    *balance -= qty * price;
                }
                OrderSide::Sell => *balance += qty * price,
            }
        }

        self.orders.lock().unwrap().push(request.clone());
        let fill = OrderFill {
            order_id: self.next_id(),
            avg_price: price,
            executed_qty: qty,
        };
        self.fills
            .lock()
            .unwrap()
            .insert(request.client_order_id.clone(), fill.clone());

        if self.lose_responses.load(Ordering::SeqCst) {
            return Err(ExchangeError::Timeout(Duration::from_secs(10)));
        }
        Ok(fill)
    }

    async fn get_order(&self, _symbol: &str, client_order_id: &str) -> Result<Option<OrderFill>, ExchangeError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(ExchangeError::Network("lookup failed".into()));
        }
        Ok(self.fills.lock().unwrap().get(client_order_id).cloned())
    }

    async fn place_protective_orders(&self, request: &ProtectiveOrderRequest) -> Result<ProtectiveOrders, ExchangeError> {
        if self.reject_protective.load(Ordering::SeqCst) {
            return Err(ExchangeError::OrderRejected("PERCENT_PRICE filter".into()));
        }
        let list_id = self.next_id();
        self.protective.lock().unwrap().insert(list_id.clone(), request.clone());
        if self.lose_protective_responses.load(Ordering::SeqCst) {
            return Err(ExchangeError::Timeout(Duration::from_secs(10)));
        }
        Ok(ProtectiveOrders {
            order_list_id: list_id,
            order_ids: vec![self.next_id(), self.next_id()],
        })
    }

    async fn get_protective_status(&self, _symbol: &str, order_list_id: &str) -> Result<ProtectiveStatus, ExchangeError> {
        if self.protective.lock().unwrap().contains_key(order_list_id) {
            return Ok(ProtectiveStatus::Open);
        }
        self.finished
            .lock()
            .unwrap()
            .get(order_list_id)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("order list {}", order_list_id)))
    }

    async fn cancel_protective_orders(&self, _symbol: &str, order_list_id: &str) -> Result<(), ExchangeError> {
        match self.protective.lock().unwrap().remove(order_list_id) {
            Some(_) => Ok(()),
            None => Err(ExchangeError::NotFound(format!("order list {}", order_list_id))),
        }
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(self
            .protective
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, req)| symbol.map_or(true, |s| s == req.symbol))
            .map(|(list_id, req)| OpenOrder {
                order_id: format!("{}-tp", list_id),
                symbol: req.symbol.clone(),
                side: OrderSide::Sell,
                price: req.take_profit_price.to_f64().unwrap_or(0.0),
                quantity: req.quantity.to_f64().unwrap_or(0.0),
                order_list_id: Some(list_id.clone()),
            })
            .collect())
    }

    async fn get_free_balance(&self, _asset: &str) -> Result<f64, ExchangeError> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn get_symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        Ok(SymbolFilters {
            step_size: Decimal::new(1, 3),
            min_qty: Decimal::new(1, 3),
            tick_size: Decimal::new(1, 2),
            min_notional: Decimal::from(5),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// One-minute candles at a constant price, oldest first, the last opening at `end`
pub fn flat_candles(n: usize, price: f64, end: DateTime<Utc>) -> Vec<Candle> {
    (0..n)
        .map(|i| Candle {
            open_time: end - chrono::Duration::minutes((n - 1 - i) as i64),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1_000.0,
            quote_volume: 1_000.0 * price,
        })
        .collect()
}

/// One-minute candles closing at `closes`, oldest first, the last opening at `end`
pub fn candles_from_closes(closes: &[f64], end: DateTime<Utc>) -> Vec<Candle> {
    let n = closes.len();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            open_time: end - chrono::Duration::minutes((n - 1 - i) as i64),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000.0,
            quote_volume: 1_000.0 * close,
        })
        .collect()
}

/// Signals an entry on every evaluation
pub struct AlwaysEnter;

impl Strategy for AlwaysEnter {
    fn evaluate(&self, candles: &[Candle]) -> Result<SignalEvaluation, IndicatorError> {
        let latest = candles.last().ok_or(IndicatorError::InsufficientData {
            required: 1,
            available: 0,
        })?;

        Ok(SignalEvaluation {
            snapshot: IndicatorSnapshot {
                rsi: 25.0,
                ema_fast: latest.close * 1.001,
                ema_slow: latest.close,
                macd: 0.2,
                macd_signal: 0.1,
                bollinger_lower: latest.close,
                bollinger_upper: latest.close * 1.02,
                volume_avg: latest.volume * 2.0,
                quote_volume: latest.quote_volume,
                recent_high: latest.close * 1.01,
            },
            conditions: EntryConditions {
                rsi_oversold: true,
                ema_bullish: true,
                macd_bullish: true,
                bollinger_touch: true,
                volume_confirmed: false,
                breakout_confirmed: false,
            },
            close: latest.close,
            entry_signal: true,
        })
    }

    fn name(&self) -> &str {
        "always-enter"
    }

    fn min_candles_required(&self) -> usize {
        1
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub saved: Mutex<Vec<BotStateSnapshot>>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, snapshot: &BotStateSnapshot) -> scalpbot::Result<()> {
        self.saved.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> scalpbot::Result<Option<BotStateSnapshot>> {
        Ok(self.saved.lock().unwrap().last().cloned())
    }
}

pub struct TestBot {
    pub exchange: Arc<ScriptedExchange>,
    pub orchestrator: Arc<Orchestrator>,
    pub supervisor: Arc<PositionSupervisor>,
    pub store: Arc<MemoryStore>,
    pub events: mpsc::Receiver<BotEvent>,
}

impl TestBot {
    pub fn drain_events(&mut self) -> Vec<BotEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        call_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(1),
    }
}

/// Limits that never get in the way unless a test is about them
pub fn relaxed_limits() -> RiskLimits {
    RiskLimits {
        max_daily_trades: 100,
        max_daily_loss_usd: 10_000.0,
        max_loss_streak: 3,
        loss_pause_minutes: 60,
        max_trades_per_hour: 100,
        min_seconds_between_entries: 0,
        symbol_cooldown_seconds: 0,
        max_trades_per_pair_hour: 100,
        ..RiskLimits::default()
    }
}

pub fn engine_settings(symbols: &[&str], close_on_shutdown: bool) -> EngineSettings {
    EngineSettings {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        polling_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(500),
        close_on_shutdown,
        screen: PairScreen::default(),
    }
}

pub fn build_bot(
    exchange: Arc<ScriptedExchange>,
    strategy: Arc<dyn Strategy>,
    limits: RiskLimits,
    settings: EngineSettings,
) -> TestBot {
    build_bot_with_retry(exchange, strategy, limits, settings, fast_retry())
}

pub fn build_bot_with_retry(
    exchange: Arc<ScriptedExchange>,
    strategy: Arc<dyn Strategy>,
    limits: RiskLimits,
    settings: EngineSettings,
    retry: RetryPolicy,
) -> TestBot {
    let portfolio = Arc::new(Portfolio::new(2));
    let risk = Arc::new(RiskGovernor::with_state(limits, RiskState::new(Utc::now())));
    let (events, rx) = EventPublisher::channel(256);
    let feed = MarketFeed::new(exchange.clone(), fast_retry(), "1m", 100);
    let executor = Executor::new(portfolio.clone(), risk.clone(), SizingRules::default());

    let supervisor = Arc::new(PositionSupervisor::new(
        exchange.clone(),
        feed,
        portfolio,
        risk,
        executor,
        ExitRules::default(),
        retry,
        events.clone(),
        "USDC",
    ));

    let store = Arc::new(MemoryStore::default());
    let orchestrator = Arc::new(Orchestrator::new(
        supervisor.clone(),
        strategy,
        events,
        Some(store.clone()),
        settings,
    ));

    TestBot {
        exchange,
        orchestrator,
        supervisor,
        store,
        events: rx,
    }
}
