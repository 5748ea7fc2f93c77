use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::execution::Portfolio;
use crate::models::SymbolFilters;
use crate::risk::RiskGovernor;
use crate::strategy::SignalEvaluation;

/// How much quote capital an entry commits
#[derive(Debug, Clone, PartialEq)]
pub struct SizingRules {
    pub position_size_pct: f64, // fraction of free quote balance
    pub min_position_usd: f64,
    pub max_position_usd: f64,
    pub size_reduction_factor: f64, // applied once per consecutive loss
}

impl Default for SizingRules {
    fn default() -> Self {
        Self {
            position_size_pct: 0.05,
            min_position_usd: 50.0,
            max_position_usd: 500.0,
            size_reduction_factor: 0.8,
        }
    }
}

impl SizingRules {
    /// free × pct × factor^losses, capped at the maximum
    pub fn position_value(&self, free_balance: f64, consecutive_losses: u32) -> f64 {
        let reduction = self.size_reduction_factor.powi(consecutive_losses as i32);
        (free_balance * self.position_size_pct * reduction).min(self.max_position_usd)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Execute { quantity: Decimal, notional: f64 },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }

    pub fn is_execute(&self) -> bool {
        matches!(self.action, ExecutionAction::Execute { .. })
    }
}

/// Entry gating and position sizing
pub struct Executor {
    portfolio: Arc<Portfolio>,
    risk: Arc<RiskGovernor>,
    sizing: SizingRules,
}

impl Executor {
    pub fn new(portfolio: Arc<Portfolio>, risk: Arc<RiskGovernor>, sizing: SizingRules) -> Self {
        Self {
            portfolio,
            risk,
            sizing,
        }
    }

    pub fn sizing(&self) -> &SizingRules {
        &self.sizing
    }

    /// Decide whether a scored signal may proceed to an entry attempt
    pub fn process_signal(&self, symbol: &str, evaluation: &SignalEvaluation) -> ExecutionDecision {
        self.process_signal_at(symbol, evaluation, Utc::now())
    }

    pub fn process_signal_at(
        &self,
        symbol: &str,
        evaluation: &SignalEvaluation,
        now: DateTime<Utc>,
    ) -> ExecutionDecision {
        if !evaluation.entry_signal {
            return ExecutionDecision::skip(format!(
                "{}/6 conditions",
                evaluation.conditions.satisfied_count()
            ));
        }

        // Check 1: Do we already have this symbol?
        if self.portfolio.has_open_position(symbol) {
            return ExecutionDecision::skip("Already have open position");
        }

        // Check 2: Portfolio capacity
        if self.portfolio.occupied_slots() >= self.portfolio.max_open() {
            return ExecutionDecision::skip(format!(
                "Max open positions reached ({})",
                self.portfolio.max_open()
            ));
        }

        // Check 3: Risk governor
        if let Err(block) = self.risk.can_open_at(now) {
            return ExecutionDecision::skip(format!("Risk: {}", block));
        }

        ExecutionDecision {
            action: ExecutionAction::Execute {
                quantity: Decimal::ZERO,
                notional: 0.0,
            },
            reason: format!(
                "Entry signal ({}/6 conditions)",
                evaluation.conditions.satisfied_count()
            ),
        }
    }

    /// Size an entry from the free quote balance and round it to the lot step
    pub fn size_position(&self, free_balance: f64, price: f64, filters: &SymbolFilters) -> ExecutionDecision {
        if price <= 0.0 {
            return ExecutionDecision::skip(format!("Invalid price {}", price));
        }

        let losses = self.risk.consecutive_losses();
        let value = self.sizing.position_value(free_balance, losses);

        if value < self.sizing.min_position_usd {
            return ExecutionDecision::skip(format!(
                "Position ${:.2} below minimum ${:.2} (free ${:.2}, {} losses)",
                value, self.sizing.min_position_usd, free_balance, losses
            ));
        }
        if value > free_balance {
            return ExecutionDecision::skip(format!(
                "Insufficient balance: need ${:.2}, have ${:.2}",
                value, free_balance
            ));
        }

        let Some(quantity) = filters.round_quantity(value / price) else {
            return ExecutionDecision::skip(format!(
                "Quantity {:.8} below lot minimum {}",
                value / price,
                filters.min_qty
            ));
        };

        if !filters.meets_min_notional(quantity, price) {
            return ExecutionDecision::skip(format!(
                "Notional below exchange minimum {}",
                filters.min_notional
            ));
        }

        if losses > 0 {
            tracing::info!(
                "Size reduced to {:.2}x after {} consecutive losses",
                self.sizing.size_reduction_factor.powi(losses as i32),
                losses
            );
        }

        ExecutionDecision {
            action: ExecutionAction::Execute { quantity, notional: value },
            reason: format!("Sized ${:.2} at ${:.4}", value, price),
        }
    }
}
