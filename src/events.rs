use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::execution::{CloseReason, Position};
use crate::notify::Notifier;
use crate::strategy::EntryConditions;

/// Facts the engine pushes to its collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        position: Position,
        reason: CloseReason,
        realized_pnl: f64,
    },
    RiskPaused {
        reason: String,
        until: DateTime<Utc>,
    },
    SignalEvaluated {
        symbol: String,
        conditions: EntryConditions,
        satisfied: usize,
        close: f64,
    },
    CriticalAlert {
        symbol: Option<String>,
        message: String,
    },
}

impl BotEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BotEvent::PositionOpened { .. } => "position_opened",
            BotEvent::PositionClosed { .. } => "position_closed",
            BotEvent::RiskPaused { .. } => "risk_paused",
            BotEvent::SignalEvaluated { .. } => "signal_evaluated",
            BotEvent::CriticalAlert { .. } => "critical_alert",
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            BotEvent::PositionOpened { position } | BotEvent::PositionClosed { position, .. } => {
                Some(&position.symbol)
            }
            BotEvent::SignalEvaluated { symbol, .. } => Some(symbol),
            BotEvent::CriticalAlert { symbol, .. } => symbol.as_deref(),
            BotEvent::RiskPaused { .. } => None,
        }
    }

    /// Signal evaluations are logged only; everything else reaches the notifier
    pub fn should_notify(&self) -> bool {
        !matches!(self, BotEvent::SignalEvaluated { .. })
    }

    /// Human-readable message for notifications
    pub fn message(&self) -> String {
        match self {
            BotEvent::PositionOpened { position: p } => format!(
                "🟢 BUY {}\nEntry: ${:.4}\nQty: {}\nTake profit: ${:.4}\nStop loss: ${:.4}",
                p.symbol, p.entry_price, p.quantity, p.take_profit_price, p.stop_loss_price
            ),
            BotEvent::PositionClosed {
                position: p,
                reason,
                realized_pnl,
            } => {
                let icon = if *realized_pnl >= 0.0 { "✅" } else { "❌" };
                format!(
                    "{} SELL {} ({})\nEntry: ${:.4}\nExit: ${:.4}\nP&L: ${:.2} (net ${:.2})",
                    icon,
                    p.symbol,
                    reason,
                    p.entry_price,
                    p.exit_price.unwrap_or_default(),
                    realized_pnl,
                    p.net_pnl().unwrap_or(*realized_pnl)
                )
            }
            BotEvent::RiskPaused { reason, until } => format!(
                "⏸️ Trading paused until {} UTC: {}",
                until.format("%Y-%m-%d %H:%M"),
                reason
            ),
            BotEvent::SignalEvaluated {
                symbol,
                conditions,
                satisfied,
                close,
            } => format!(
                "{} @ {:.4}: {}/6 [{}]",
                symbol,
                close,
                satisfied,
                conditions.summary()
            ),
            BotEvent::CriticalAlert { symbol, message } => match symbol {
                Some(s) => format!("🚨 {}: {}", s, message),
                None => format!("🚨 {}", message),
            },
        }
    }
}

/// Append-only destination for events (event log, analytics)
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &BotEvent) -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

/// Non-blocking handle the engine publishes through
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<BotEvent>,
}

impl EventPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BotEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Fire-and-forget; a full or closed channel drops the event
    pub fn publish(&self, event: BotEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, dropping {}", event.kind());
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!("Event channel closed, dropping {}", event.kind());
            }
        }
    }
}

/// Fans events out to the log, every sink and the notifier
pub struct EventDispatcher {
    rx: mpsc::Receiver<BotEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl EventDispatcher {
    pub fn new(
        rx: mpsc::Receiver<BotEvent>,
        sinks: Vec<Arc<dyn EventSink>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self { rx, sinks, notifier }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until every publisher is dropped and the channel drains
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.dispatch(&event).await;
        }
        tracing::debug!("Event dispatcher stopped");
    }

    async fn dispatch(&self, event: &BotEvent) {
        log_event(event);

        for sink in &self.sinks {
            if let Err(e) = sink.record(event).await {
                tracing::warn!("Event sink {} failed for {}: {:#}", sink.name(), event.kind(), e);
            }
        }

        if let Some(notifier) = &self.notifier {
            if event.should_notify() {
                if let Err(e) = notifier.send(&event.message()).await {
                    tracing::warn!("Notification failed for {}: {:#}", event.kind(), e);
                }
            }
        }
    }
}

fn log_event(event: &BotEvent) {
    match event {
        BotEvent::SignalEvaluated { .. } => tracing::debug!("{}", event.message()),
        BotEvent::RiskPaused { .. } => tracing::warn!("{}", event.message()),
        BotEvent::CriticalAlert { .. } => tracing::error!("{}", event.message()),
        _ => tracing::info!("{}", event.message().replace('\n', " | ")),
    }
}
