use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::error::{EngineError, IndicatorError};
use crate::events::{BotEvent, EventPublisher};
use crate::execution::{CloseReason, EntryOutcome, PositionSupervisor, SupervisionOutcome};
use crate::persistence::{BotStateSnapshot, StateStore};
use crate::strategy::{validate_candle_uniformity, PairScreen, SignalEvaluation, Strategy};

/// Loop timing and shutdown behaviour
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub symbols: Vec<String>,
    pub polling_interval: Duration,
    pub shutdown_grace: Duration,
    pub close_on_shutdown: bool,
    pub screen: PairScreen,
}

impl EngineSettings {
    pub fn from_settings(settings: &Settings, close_on_shutdown: bool) -> Self {
        Self {
            symbols: settings.symbols.clone(),
            polling_interval: settings.polling_interval(),
            shutdown_grace: settings.shutdown_grace(),
            close_on_shutdown,
            screen: settings.screen.clone(),
        }
    }
}

/// What one symbol worker did this tick
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    Supervised(SupervisionOutcome),
    /// The pair screen turned the symbol away before scoring
    Filtered(String),
    Evaluated {
        evaluation: SignalEvaluation,
        entry: Option<EntryOutcome>,
    },
}

impl SymbolOutcome {
    /// Whether the portfolio or risk counters changed
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            SymbolOutcome::Supervised(SupervisionOutcome::Closed(_))
                | SymbolOutcome::Supervised(SupervisionOutcome::Held { trailing_moved: true, .. })
                | SymbolOutcome::Evaluated {
                    entry: Some(EntryOutcome::Opened(_)),
                    ..
                }
        )
    }
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub opened: u64,
    pub closed: u64,
    pub errors: u64,
    pub closed_on_shutdown: usize,
}

type Completion = (String, Result<SymbolOutcome, EngineError>);

/// Polls every tracked symbol on a fixed interval.
///
/// Each symbol runs in its own task and at most one task per symbol is in
/// flight, so an entry attempt never overlaps that symbol's exit supervision
/// and a stalled fetch only delays its own symbol.
pub struct Orchestrator {
    supervisor: Arc<PositionSupervisor>,
    strategy: Arc<dyn Strategy>,
    events: EventPublisher,
    store: Option<Arc<dyn StateStore>>,
    settings: EngineSettings,
}

impl Orchestrator {
    pub fn new(
        supervisor: Arc<PositionSupervisor>,
        strategy: Arc<dyn Strategy>,
        events: EventPublisher,
        store: Option<Arc<dyn StateStore>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            supervisor,
            strategy,
            events,
            store,
            settings,
        }
    }

    pub fn supervisor(&self) -> &Arc<PositionSupervisor> {
        &self.supervisor
    }

    /// Run until `shutdown` flips to true, then drain and persist
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        let mut summary = RunSummary::default();

        match self.supervisor.reconcile().await {
            Ok(dropped) if !dropped.is_empty() => {
                tracing::warn!("Reconciliation dropped {} stale positions", dropped.len());
                self.save_state().await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Reconciliation skipped: {}", e),
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight: HashSet<String> = HashSet::new();

        let mut ticker = tokio::time::interval(self.settings.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "💹 Engine started: {} symbols, {} every {}s",
            self.settings.symbols.len(),
            self.strategy.name(),
            self.settings.polling_interval.as_secs()
        );

        if *shutdown.borrow() {
            tracing::info!("Shutdown requested before first tick");
        } else {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    Some((symbol, result)) = done_rx.recv() => {
                        in_flight.remove(&symbol);
                        self.complete(&symbol, result, &mut summary).await;
                    }
                    _ = ticker.tick() => {
                        summary.ticks += 1;
                        self.tick(&mut in_flight, &done_tx);
                    }
                }
            }
        }

        tracing::info!("⚠️  Shutting down, waiting for {} symbol tasks", in_flight.len());

        // In-flight entries may be between their fill and their protective orders: never abort them
        while !in_flight.is_empty() {
            match tokio::time::timeout(self.settings.shutdown_grace, done_rx.recv()).await {
                Ok(Some((symbol, result))) => {
                    in_flight.remove(&symbol);
                    self.complete(&symbol, result, &mut summary).await;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("Still waiting for {:?} to finish", in_flight);
                }
            }
        }

        if self.settings.close_on_shutdown {
            summary.closed_on_shutdown = self.supervisor.close_all(CloseReason::Manual).await;
            tracing::info!("Closed {} positions on shutdown", summary.closed_on_shutdown);
        }

        self.save_state().await;
        tracing::info!(
            "👋 Engine stopped after {} ticks ({} opened, {} closed, {} errors)",
            summary.ticks,
            summary.opened,
            summary.closed,
            summary.errors
        );
        summary
    }

    fn tick(self: &Arc<Self>, in_flight: &mut HashSet<String>, done_tx: &mpsc::UnboundedSender<Completion>) {
        tracing::info!("💹 [TRADING] Tick at {}", Utc::now().format("%H:%M:%S"));

        if self.supervisor.risk().rollover_if_new_day() {
            tracing::info!("📅 New trading day, risk counters reset");
        }

        self.log_portfolio_summary();

        for symbol in &self.settings.symbols {
            if !in_flight.insert(symbol.clone()) {
                tracing::debug!(symbol = %symbol, "Previous tick still running, skipping");
                continue;
            }

            let engine = Arc::clone(self);
            let tx = done_tx.clone();
            let symbol = symbol.clone();

            tokio::spawn(async move {
                let worker_engine = Arc::clone(&engine);
                let worker_symbol = symbol.clone();
                let worker = tokio::spawn(async move { worker_engine.process_symbol(&worker_symbol).await });

                let result = match worker.await {
                    Ok(result) => result,
                    Err(e) => Err(EngineError::WorkerFailed(e.to_string())),
                };
                // the loop owns the receiver until every worker has reported
                let _ = tx.send((symbol, result));
            });
        }
    }

    /// One symbol's work for this tick: supervise its open position, or score it for entry
    pub async fn process_symbol(&self, symbol: &str) -> Result<SymbolOutcome, EngineError> {
        if self.supervisor.portfolio().has_open_position(symbol) {
            let outcome = self.supervisor.supervise(symbol).await?;
            return Ok(SymbolOutcome::Supervised(outcome));
        }

        if let Some(reason) = self.screen_out(symbol).await? {
            return Ok(SymbolOutcome::Filtered(reason));
        }

        let feed = self.supervisor.feed();
        let candles = feed.candles(symbol).await?;

        if let Some(secs) = feed.interval_seconds() {
            validate_candle_uniformity(&candles, secs).map_err(|e| EngineError::DataQuality(e.to_string()))?;
        }

        let evaluation = self.strategy.evaluate(&candles)?;

        self.events.publish(BotEvent::SignalEvaluated {
            symbol: symbol.to_string(),
            conditions: evaluation.conditions,
            satisfied: evaluation.conditions.satisfied_count(),
            close: evaluation.close,
        });

        if !evaluation.entry_signal {
            return Ok(SymbolOutcome::Evaluated { evaluation, entry: None });
        }

        let entry = self.supervisor.open_position(symbol, &evaluation).await?;
        Ok(SymbolOutcome::Evaluated {
            evaluation,
            entry: Some(entry),
        })
    }

    async fn screen_out(&self, symbol: &str) -> Result<Option<String>, EngineError> {
        let screen = &self.settings.screen;
        if screen.is_blacklisted(symbol) {
            return Ok(Some("blacklisted".to_string()));
        }
        if !screen.needs_ticker() {
            return Ok(None);
        }

        let ticker = self.supervisor.feed().ticker_24h(symbol).await?;
        Ok(screen.check_ticker(&ticker))
    }

    async fn complete(&self, symbol: &str, result: Result<SymbolOutcome, EngineError>, summary: &mut RunSummary) {
        match result {
            Ok(outcome) => {
                match &outcome {
                    SymbolOutcome::Supervised(SupervisionOutcome::Closed(p)) => {
                        summary.closed += 1;
                        tracing::info!(
                            symbol = %symbol,
                            "✓ Closed {} @ ${:.4}",
                            p.close_reason.map(|r| r.as_str()).unwrap_or("?"),
                            p.exit_price.unwrap_or_default()
                        );
                    }
                    SymbolOutcome::Evaluated {
                        entry: Some(EntryOutcome::Opened(p)),
                        ..
                    } => {
                        summary.opened += 1;
                        tracing::info!(symbol = %symbol, "✓ Opened position {}", p.id);
                    }
                    SymbolOutcome::Evaluated {
                        entry: Some(EntryOutcome::Skipped(reason)),
                        ..
                    } => {
                        tracing::info!(symbol = %symbol, "  → Entry skipped: {}", reason);
                    }
                    SymbolOutcome::Filtered(reason) => {
                        tracing::debug!(symbol = %symbol, "  → Screened out: {}", reason);
                    }
                    _ => {}
                }

                if outcome.changed_state() {
                    self.save_state().await;
                }
            }
            Err(EngineError::Indicator(IndicatorError::InsufficientData { required, available })) => {
                tracing::info!(
                    symbol = %symbol,
                    "  → Collecting data... ({}/{} needed)",
                    available,
                    required
                );
            }
            Err(e @ EngineError::ProtectiveOrderFailure { .. }) => {
                summary.errors += 1;
                tracing::error!(symbol = %symbol, "✗ {}", e);
            }
            Err(e) => {
                summary.errors += 1;
                tracing::warn!(symbol = %symbol, "✗ {}", e);
            }
        }
    }

    async fn save_state(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let snapshot = BotStateSnapshot::capture(self.supervisor.risk(), self.supervisor.portfolio());
        match tokio::time::timeout(Duration::from_secs(5), store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to save state: {}", e),
            Err(_) => tracing::warn!("Saving state timed out"),
        }
    }

    fn log_portfolio_summary(&self) {
        let portfolio = self.supervisor.portfolio();
        let risk = self.supervisor.risk().snapshot();
        let open = portfolio.open_positions();

        tracing::info!(
            "📊 Open: {}/{} | Session P&L: ${:.2} | Today: {} trades, ${:.2} lost, streak {}",
            open.len(),
            portfolio.max_open(),
            portfolio.total_pnl(),
            risk.daily_trade_count,
            risk.daily_realized_loss_usd,
            risk.consecutive_losses
        );

        for position in open {
            tracing::info!(
                "    {} | Entry: ${:.4} | TP ${:.4} | SL ${:.4} | Trail {}",
                position.symbol,
                position.entry_price,
                position.take_profit_price,
                position.stop_loss_price,
                position
                    .trailing_stop_price
                    .map(|t| format!("${:.4}", t))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }
}
