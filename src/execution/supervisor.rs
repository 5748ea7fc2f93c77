use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::api::Exchange;
use crate::error::{EngineError, ExchangeError, PositionError};
use crate::events::{BotEvent, EventPublisher};
use crate::execution::executor::{ExecutionAction, Executor};
use crate::execution::position::{CloseReason, ExitRules, MomentumReading, Position, ProtectiveLevels};
use crate::execution::price_feed::MarketFeed;
use crate::execution::retry::{with_retry, RetryPolicy};
use crate::execution::Portfolio;
use crate::models::{
    decimal_to_f64, OrderFill, OrderRequest, OrderSide, ProtectiveOrderRequest, ProtectiveStatus, SymbolFilters,
};
use crate::risk::RiskGovernor;
use crate::strategy::SignalEvaluation;

/// Stop-limit leg sits this far below the stop trigger so it still fills on a gap
const STOP_LIMIT_SLIPPAGE: f64 = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Opened(Position),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisionOutcome {
    NoPosition,
    Held {
        price: f64,
        trailing_stop: Option<f64>,
        /// The trailing stop was armed or raised this step
        trailing_moved: bool,
    },
    Closed(Position),
}

/// Drives positions through PENDING -> OPEN -> CLOSED against the exchange
pub struct PositionSupervisor {
    exchange: Arc<dyn Exchange>,
    feed: MarketFeed,
    portfolio: Arc<Portfolio>,
    risk: Arc<RiskGovernor>,
    executor: Executor,
    rules: ExitRules,
    retry: RetryPolicy,
    events: EventPublisher,
    quote_asset: String,
}

impl PositionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        feed: MarketFeed,
        portfolio: Arc<Portfolio>,
        risk: Arc<RiskGovernor>,
        executor: Executor,
        rules: ExitRules,
        retry: RetryPolicy,
        events: EventPublisher,
        quote_asset: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            feed,
            portfolio,
            risk,
            executor,
            rules,
            retry,
            events,
            quote_asset: quote_asset.into(),
        }
    }

    pub fn portfolio(&self) -> &Arc<Portfolio> {
        &self.portfolio
    }

    pub fn risk(&self) -> &Arc<RiskGovernor> {
        &self.risk
    }

    pub fn feed(&self) -> &MarketFeed {
        &self.feed
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Attempt an entry for a scored signal.
    ///
    /// Gate refusals come back as `Skipped`. Exchange failures before the
    /// protective orders are in place leave no trace in the portfolio or the
    /// risk counters.
    pub async fn open_position(&self, symbol: &str, evaluation: &SignalEvaluation) -> Result<EntryOutcome, EngineError> {
        let decision = self.executor.process_signal(symbol, evaluation);
        if !decision.is_execute() {
            return Ok(EntryOutcome::Skipped(decision.reason));
        }

        let permit = match self.risk.try_begin_entry(symbol) {
            Ok(permit) => permit,
            Err(block) => return Ok(EntryOutcome::Skipped(format!("Risk: {}", block))),
        };
        let reservation = match self.portfolio.try_reserve(symbol) {
            Ok(slot) => slot,
            Err(block) => return Ok(EntryOutcome::Skipped(block.to_string())),
        };

        let balance = with_retry(&self.retry, "get_free_balance", || {
            self.exchange.get_free_balance(&self.quote_asset)
        })
        .await?;
        let filters = self.filters(symbol).await?;
        let price = self.feed.price(symbol).await?;

        let sizing = self.executor.size_position(balance, price, &filters);
        let quantity = match sizing.action {
            ExecutionAction::Execute { quantity, .. } => quantity,
            ExecutionAction::Skip => return Ok(EntryOutcome::Skipped(sizing.reason)),
        };

        tracing::info!(
            symbol = %symbol,
            "🎯 Entering: {} ({} {} ≈ ${:.4})",
            sizing.reason,
            quantity,
            symbol,
            price
        );

        let fill = self.market_order(symbol, OrderSide::Buy, quantity).await?;
        if fill.executed_qty <= 0.0 || fill.avg_price <= 0.0 {
            return Err(EngineError::EntryRefused(format!(
                "{} entry order {} reported no fill",
                symbol, fill.order_id
            )));
        }

        // Protect exactly what was bought, to the lot step
        let filled_qty = filters.round_quantity(fill.executed_qty).unwrap_or(quantity);

        let (protective, levels) = match self.protective_request(symbol, fill.avg_price, filled_qty, &filters) {
            Ok(built) => built,
            Err(e) => return Err(self.unwind_entry(symbol, filled_qty, e).await),
        };

        let mut position = Position::pending(
            symbol.to_string(),
            fill.avg_price,
            decimal_to_f64(filled_qty),
            levels,
            fill.order_id.clone(),
            Utc::now(),
        );

        let placed = with_retry(&self.retry, "place_protective_orders", || {
            self.exchange.place_protective_orders(&protective)
        })
        .await;

        // A retry after a lost response can be refused as a duplicate while the first pair is live
        let list_id = match placed {
            Ok(orders) => orders.order_list_id,
            Err(e) => match self.find_protective_list(symbol).await {
                Some(list_id) => {
                    tracing::warn!(symbol = %symbol, "Protective orders reported {}, adopting live pair {}", e, list_id);
                    list_id
                }
                None => return Err(self.unwind_entry(symbol, filled_qty, e).await),
            },
        };

        position.mark_open(Some(list_id))?;
        reservation.commit(position.clone());
        permit.commit();

        self.events.publish(BotEvent::PositionOpened {
            position: position.clone(),
        });

        Ok(EntryOutcome::Opened(position))
    }

    /// Fetch the price and run one supervision step for `symbol`
    pub async fn supervise(&self, symbol: &str) -> Result<SupervisionOutcome, EngineError> {
        let Some(position) = self.portfolio.get_open_position(symbol) else {
            return Ok(SupervisionOutcome::NoPosition);
        };
        let price = self.feed.price(symbol).await?;
        let now = Utc::now();
        let momentum = self.momentum_reading(&position, price, now).await;
        self.supervise_with(symbol, price, momentum.as_ref(), now).await
    }

    /// One supervision step at a known price
    pub async fn supervise_at(
        &self,
        symbol: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<SupervisionOutcome, EngineError> {
        self.supervise_with(symbol, price, None, now).await
    }

    /// One supervision step. The protective pair is checked first: if a leg
    /// executed on the exchange the position closes at that leg's price
    /// before any bot-side exit is considered.
    pub async fn supervise_with(
        &self,
        symbol: &str,
        price: f64,
        momentum: Option<&MomentumReading>,
        now: DateTime<Utc>,
    ) -> Result<SupervisionOutcome, EngineError> {
        if let Some(closed) = self.settle_exchange_exit(symbol, now).await? {
            return Ok(SupervisionOutcome::Closed(closed));
        }

        let step = self.portfolio.with_open_position(symbol, |p| {
            let before = p.trailing_stop_price;
            let reason = p.check_exit_with(price, momentum, now, &self.rules);
            (reason, before, p.trailing_stop_price, p.unrealized_pnl_pct(price))
        });

        let Some((reason, before, trailing_stop, pnl_pct)) = step else {
            return Ok(SupervisionOutcome::NoPosition);
        };

        match reason {
            Some(reason) => {
                let position = self
                    .portfolio
                    .get_open_position(symbol)
                    .ok_or_else(|| EngineError::EntryRefused(format!("{} closed concurrently", symbol)))?;
                let closed = self.close_position(&position, reason, price, now).await?;
                Ok(SupervisionOutcome::Closed(closed))
            }
            None => {
                let trailing_moved = trailing_stop != before;
                if trailing_moved {
                    if let Some(level) = trailing_stop {
                        tracing::info!(
                            symbol = %symbol,
                            "📈 Trailing stop {} ${:.4} (price ${:.4}, {:+.2}%)",
                            if before.is_none() { "armed at" } else { "raised to" },
                            level,
                            price,
                            pnl_pct
                        );
                    }
                }
                tracing::debug!(symbol = %symbol, "Holding at ${:.4} ({:+.2}%)", price, pnl_pct);
                Ok(SupervisionOutcome::Held {
                    price,
                    trailing_stop,
                    trailing_moved,
                })
            }
        }
    }

    /// Close an open position.
    ///
    /// Cancels the protective pair first. If the exchange no longer knows the
    /// pair, the leg that executed decides the reason and exit price and no
    /// market order is sent. On any other failure the position stays OPEN and
    /// is retried next tick.
    pub async fn close_position(
        &self,
        position: &Position,
        reason: CloseReason,
        last_price: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let symbol = position.symbol.as_str();
        let mut reason = reason;
        let mut exchange_exit = None;

        if let Some(list_id) = &position.protective_order_list_id {
            let cancelled = with_retry(&self.retry, "cancel_protective_orders", || {
                self.exchange.cancel_protective_orders(symbol, list_id)
            })
            .await;

            match cancelled {
                Ok(()) => {
                    // The pair is gone; a failed sell below must not look like an exchange fill next tick
                    self.portfolio
                        .with_open_position(symbol, |p| p.protective_order_list_id = None);
                }
                Err(ExchangeError::NotFound(_)) => {
                    if let Some((leg_reason, leg_price)) = self.executed_leg(position, list_id, last_price).await {
                        reason = leg_reason;
                        exchange_exit = Some(leg_price);
                        tracing::info!(
                            symbol = %symbol,
                            "Protective orders already executed on exchange, recording {} at ${:.4}",
                            reason,
                            leg_price
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, "Failed to cancel protective orders: {}", e);
                    return Err(e.into());
                }
            }
        }

        let exit_price = if let Some(price) = exchange_exit {
            price
        } else {
            let filters = self.filters(symbol).await?;
            let quantity = filters.round_quantity(position.quantity).ok_or_else(|| {
                ExchangeError::OrderRejected(format!("{} quantity {} below lot minimum", symbol, position.quantity))
            })?;

            match self.market_order(symbol, OrderSide::Sell, quantity).await {
                Ok(fill) if fill.avg_price > 0.0 => fill.avg_price,
                Ok(_) => last_price,
                Err(e) => {
                    self.events.publish(BotEvent::CriticalAlert {
                        symbol: Some(symbol.to_string()),
                        message: format!("exit sell failed ({}), position left open: {}", reason, e),
                    });
                    return Err(e.into());
                }
            }
        };

        self.finish_close(position, reason, exit_price, now)
    }

    /// Record a close whose exit already happened: archive, feed the risk
    /// counters and announce it
    fn finish_close(
        &self,
        position: &Position,
        reason: CloseReason,
        exit_price: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let closed = self
            .portfolio
            .with_open_position(&position.symbol, |p| -> Result<Position, PositionError> {
                p.close_at(exit_price, reason, self.rules.fee_rate, now)?;
                Ok(p.clone())
            })
            .ok_or(PositionError::NotOpen(position.id))??;

        self.portfolio.archive(closed.clone());

        let realized_pnl = closed.realized_pnl.unwrap_or(0.0);
        if let Some(pause) = self.risk.record_close_at(realized_pnl, now) {
            self.events.publish(BotEvent::RiskPaused {
                reason: pause.reason.to_string(),
                until: pause.until,
            });
        }

        self.events.publish(BotEvent::PositionClosed {
            position: closed.clone(),
            reason,
            realized_pnl,
        });

        Ok(closed)
    }

    /// Close every open position at market. Returns how many closed.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;

        for position in self.portfolio.open_positions() {
            let price = match self.feed.price(&position.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    tracing::error!("Cannot price {} for close: {}", position.symbol, e);
                    continue;
                }
            };

            match self.close_position(&position, reason, price, Utc::now()).await {
                Ok(_) => closed += 1,
                Err(e) => tracing::error!("Failed to close {}: {}", position.symbol, e),
            }
        }

        closed
    }

    /// Drop restored positions whose protective orders are no longer on the exchange
    pub async fn reconcile(&self) -> Result<Vec<Position>, EngineError> {
        let restored = self.portfolio.open_positions();
        if restored.is_empty() {
            return Ok(Vec::new());
        }

        let open_orders = with_retry(&self.retry, "get_open_orders", || self.exchange.get_open_orders(None)).await?;

        let mut dropped = Vec::new();
        for position in restored {
            let still_protected = position.protective_order_list_id.as_ref().map_or(false, |list_id| {
                open_orders
                    .iter()
                    .any(|o| o.symbol == position.symbol && o.order_list_id.as_ref() == Some(list_id))
            });

            if !still_protected {
                tracing::warn!(
                    "Restored {} position has no live protective orders, dropping it",
                    position.symbol
                );
                if let Some(p) = self.portfolio.discard(&position.symbol) {
                    dropped.push(p);
                }
            }
        }

        Ok(dropped)
    }

    async fn filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        with_retry(&self.retry, "get_symbol_filters", || self.exchange.get_symbol_filters(symbol)).await
    }

    /// Close the position if its protective pair finished on the exchange.
    ///
    /// A pair that vanished without a fill leaves the position unprotected:
    /// the list id is cleared so bot-side exits sell at market. A failed
    /// status lookup defers to the bot-side checks.
    async fn settle_exchange_exit(&self, symbol: &str, now: DateTime<Utc>) -> Result<Option<Position>, EngineError> {
        let Some(position) = self.portfolio.get_open_position(symbol) else {
            return Ok(None);
        };
        let Some(list_id) = position.protective_order_list_id.as_deref() else {
            return Ok(None);
        };

        let status = with_retry(&self.retry, "get_protective_status", || {
            self.exchange.get_protective_status(symbol, list_id)
        })
        .await;

        match status {
            Ok(ProtectiveStatus::Open) => Ok(None),
            Ok(ProtectiveStatus::Filled { leg, price }) => {
                let reason = CloseReason::from(leg);
                tracing::info!(symbol = %symbol, "{} executed on exchange at ${:.4}", reason, price);
                self.finish_close(&position, reason, price, now).map(Some)
            }
            Ok(ProtectiveStatus::Cancelled) => {
                tracing::warn!(symbol = %symbol, "Protective orders {} cancelled outside the bot", list_id);
                self.portfolio
                    .with_open_position(symbol, |p| p.protective_order_list_id = None);
                self.events.publish(BotEvent::CriticalAlert {
                    symbol: Some(symbol.to_string()),
                    message: format!("protective orders {} cancelled on exchange, exits fall back to market", list_id),
                });
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Protective order status unavailable: {}", e);
                Ok(None)
            }
        }
    }

    /// Which leg executed after a cancel found the pair gone. None when
    /// nothing executed and the position still has to be sold. Falls back to
    /// the side of entry the last price is on when the exchange cannot say.
    async fn executed_leg(&self, position: &Position, list_id: &str, last_price: f64) -> Option<(CloseReason, f64)> {
        let status = with_retry(&self.retry, "get_protective_status", || {
            self.exchange.get_protective_status(&position.symbol, list_id)
        })
        .await;

        match status {
            Ok(ProtectiveStatus::Filled { leg, price }) => Some((leg.into(), price)),
            Ok(ProtectiveStatus::Cancelled) => None,
            other => {
                if let Err(e) = other {
                    tracing::debug!(symbol = %position.symbol, "Protective order status unavailable: {}", e);
                }
                if last_price >= position.entry_price {
                    Some((CloseReason::TakeProfit, position.take_profit_price))
                } else {
                    Some((CloseReason::StopLoss, position.stop_loss_price))
                }
            }
        }
    }

    /// Momentum read from recent candles, only when the early-exit rule could fire
    async fn momentum_reading(&self, position: &Position, price: f64, now: DateTime<Utc>) -> Option<MomentumReading> {
        let rule = self.rules.momentum_exit.as_ref()?;
        if !rule.applies(position, price, now) {
            return None;
        }

        match self.feed.candles(&position.symbol).await {
            Ok(candles) => {
                let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
                rule.read(&closes)
            }
            Err(e) => {
                tracing::warn!(symbol = %position.symbol, "No candles for momentum check: {}", e);
                None
            }
        }
    }

    /// Live protective pair for `symbol`, if one exists on the exchange
    async fn find_protective_list(&self, symbol: &str) -> Option<String> {
        let orders = with_retry(&self.retry, "get_open_orders", || self.exchange.get_open_orders(Some(symbol)))
            .await
            .ok()?;
        orders
            .into_iter()
            .find(|o| o.side == OrderSide::Sell)
            .and_then(|o| o.order_list_id)
    }

    /// Submit a market order without risking a second fill.
    ///
    /// Every submission carries a fresh client id. When a response is lost
    /// the order is looked up by that id before anything is resubmitted, and
    /// a lookup that cannot answer ends the attempt. Rate-limit refusals are
    /// resubmitted after the backoff.
    async fn market_order(&self, symbol: &str, side: OrderSide, quantity: Decimal) -> Result<OrderFill, ExchangeError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request = OrderRequest {
                symbol: symbol.to_string(),
                side,
                quantity,
                client_order_id: client_id(),
            };

            let err = match tokio::time::timeout(self.retry.call_timeout, self.exchange.place_order(&request)).await {
                Ok(Ok(fill)) => return Ok(fill),
                Ok(Err(e)) => e,
                Err(_) => ExchangeError::Timeout(self.retry.call_timeout),
            };

            if err.outcome_unknown() {
                let lookup = with_retry(&self.retry, "get_order", || {
                    self.exchange.get_order(symbol, &request.client_order_id)
                })
                .await;

                match lookup {
                    Ok(Some(fill)) if fill.executed_qty > 0.0 => {
                        tracing::info!(
                            symbol = %symbol,
                            "{} order {} executed despite lost response ({})",
                            side.as_str(),
                            request.client_order_id,
                            err
                        );
                        return Ok(fill);
                    }
                    Ok(_) => {
                        tracing::debug!(symbol = %symbol, "{} order {} did not execute", side.as_str(), request.client_order_id);
                    }
                    Err(lookup_err) => {
                        tracing::error!(
                            symbol = %symbol,
                            "🚨 {} order {} status unknown ({}; lookup: {}), not resubmitting",
                            side.as_str(),
                            request.client_order_id,
                            err,
                            lookup_err
                        );
                        self.events.publish(BotEvent::CriticalAlert {
                            symbol: Some(symbol.to_string()),
                            message: format!(
                                "{} order {} may have executed ({}), check the account",
                                side.as_str(),
                                request.client_order_id,
                                err
                            ),
                        });
                        return Err(err);
                    }
                }
            } else if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= max_attempts {
                tracing::warn!("place_order failed after {} attempts: {}", attempt, err);
                return Err(err);
            }

            let delay = self.retry.delay_after(attempt, &err);
            tracing::debug!(
                "place_order failed: {}, resubmitting in {}ms (attempt {}/{})",
                err,
                delay.as_millis(),
                attempt,
                max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn protective_request(
        &self,
        symbol: &str,
        entry_price: f64,
        quantity: Decimal,
        filters: &SymbolFilters,
    ) -> Result<(ProtectiveOrderRequest, ProtectiveLevels), ExchangeError> {
        let levels = self.rules.levels(entry_price);
        let invalid = |what: &str| ExchangeError::OrderRejected(format!("cannot round {} for {}", what, symbol));

        let take_profit = filters.round_price(levels.take_profit).ok_or_else(|| invalid("take-profit"))?;
        let stop_loss = filters.round_price(levels.stop_loss).ok_or_else(|| invalid("stop-loss"))?;
        let stop_limit = filters
            .round_price(levels.stop_loss * (1.0 - STOP_LIMIT_SLIPPAGE))
            .ok_or_else(|| invalid("stop-limit"))?;

        let request = ProtectiveOrderRequest {
            symbol: symbol.to_string(),
            quantity,
            take_profit_price: take_profit,
            stop_loss_price: stop_loss,
            stop_limit_price: stop_limit,
            list_client_id: client_id(),
        };
        let levels = ProtectiveLevels {
            take_profit: decimal_to_f64(take_profit),
            stop_loss: decimal_to_f64(stop_loss),
            trailing_activation: levels.trailing_activation,
        };

        Ok((request, levels))
    }

    /// Market-sell an entry that could not be protected. Never leaves the position observable.
    async fn unwind_entry(&self, symbol: &str, quantity: Decimal, cause: ExchangeError) -> EngineError {
        tracing::error!(
            symbol = %symbol,
            "🚨 Protective orders failed ({}), unwinding entry of {}",
            cause,
            quantity
        );

        let unwound = match self.market_order(symbol, OrderSide::Sell, quantity).await {
            Ok(fill) => {
                tracing::warn!(symbol = %symbol, "Entry unwound at ${:.4}", fill.avg_price);
                true
            }
            Err(e) => {
                tracing::error!(symbol = %symbol, "🚨 Unwind failed, {} {} left unprotected: {}", quantity, symbol, e);
                false
            }
        };

        let message = if unwound {
            format!("protective orders failed ({}), entry unwound at market", cause)
        } else {
            format!("protective orders failed ({}) and unwind failed: {} held unprotected", cause, quantity)
        };
        self.events.publish(BotEvent::CriticalAlert {
            symbol: Some(symbol.to_string()),
            message,
        });

        EngineError::ProtectiveOrderFailure {
            symbol: symbol.to_string(),
            unwound,
            source: cause,
        }
    }
}

fn client_id() -> String {
    format!("sb-{}", Uuid::new_v4().simple())
}
