use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PositionError;
use crate::indicators::{calculate_macd, calculate_rsi};
use crate::models::ProtectiveLeg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending, // entry filled, protective orders not yet confirmed
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    Timeout,
    Stagnation,
    WeakMomentum,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TrailingStop => "TRAILING_STOP",
            CloseReason::Timeout => "TIMEOUT",
            CloseReason::Stagnation => "STAGNATION",
            CloseReason::WeakMomentum => "WEAK_MOMENTUM",
            CloseReason::Manual => "MANUAL",
        }
    }
}

impl From<ProtectiveLeg> for CloseReason {
    fn from(leg: ProtectiveLeg) -> Self {
        match leg {
            ProtectiveLeg::TakeProfit => CloseReason::TakeProfit,
            ProtectiveLeg::StopLoss => CloseReason::StopLoss,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Close a position whose P&L has stayed inside a narrow band for too long.
/// The band is in percent of the entry price, bounds inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct StagnationRule {
    pub after: Duration,
    pub low_pct: f64,
    pub high_pct: f64,
}

impl Default for StagnationRule {
    fn default() -> Self {
        Self {
            after: Duration::minutes(15),
            low_pct: -0.1,
            high_pct: 0.2,
        }
    }
}

/// RSI and MACD of the recent closes, read while a position is held
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumReading {
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
}

/// Cut a losing position early once momentum has collapsed
#[derive(Debug, Clone, PartialEq)]
pub struct MomentumExitRule {
    pub after: Duration,
    pub rsi_below: f64,
    /// Only positions losing more than this (percent, negative) are cut
    pub max_pnl_pct: f64,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
}

impl Default for MomentumExitRule {
    fn default() -> Self {
        Self {
            after: Duration::minutes(5),
            rsi_below: 25.0,
            max_pnl_pct: -0.2,
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
        }
    }
}

impl MomentumExitRule {
    /// Whether the position is old enough and deep enough in loss for a reading to matter
    pub fn applies(&self, position: &Position, price: f64, now: DateTime<Utc>) -> bool {
        position.age_at(now) > self.after && position.unrealized_pnl_pct(price) < self.max_pnl_pct
    }

    /// Momentum of an oldest-first close series. None when the series is too short.
    pub fn read(&self, closes: &[f64]) -> Option<MomentumReading> {
        let rsi = calculate_rsi(closes, self.rsi_period)?;
        let macd = calculate_macd(closes, self.macd_fast, self.macd_slow, self.macd_signal)?;
        Some(MomentumReading {
            rsi,
            macd: macd.macd,
            macd_signal: macd.signal,
        })
    }

    fn triggers(&self, reading: &MomentumReading) -> bool {
        reading.rsi < self.rsi_below && reading.macd < reading.macd_signal
    }
}

/// Exit thresholds as fractions of the entry price
#[derive(Debug, Clone, PartialEq)]
pub struct ExitRules {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_distance_pct: f64,
    pub max_hold: Duration,
    pub stagnation: Option<StagnationRule>,
    pub momentum_exit: Option<MomentumExitRule>,
    pub fee_rate: f64, // per side
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            take_profit_pct: 0.009,
            stop_loss_pct: 0.004,
            trailing_activation_pct: 0.005,
            trailing_distance_pct: 0.003,
            max_hold: Duration::minutes(45),
            stagnation: Some(StagnationRule::default()),
            momentum_exit: Some(MomentumExitRule::default()),
            fee_rate: 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLevels {
    pub take_profit: f64,
    pub stop_loss: f64,
    pub trailing_activation: f64,
}

impl ExitRules {
    pub fn levels(&self, entry_price: f64) -> ProtectiveLevels {
        ProtectiveLevels {
            take_profit: entry_price * (1.0 + self.take_profit_pct),
            stop_loss: entry_price * (1.0 - self.stop_loss_pct),
            trailing_activation: entry_price * (1.0 + self.trailing_activation_pct),
        }
    }
}

/// Trailing stop candidate for `price`, never below the previous level
pub fn ratchet_trailing(old: Option<f64>, price: f64, distance_pct: f64) -> f64 {
    let candidate = price * (1.0 - distance_pct);
    match old {
        Some(prev) => prev.max(candidate),
        None => candidate,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_activation_price: f64,
    pub trailing_stop_price: Option<f64>, // set once activation is reached, only ratchets up
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>, // gross
    pub estimated_fees: Option<f64>,
    pub entry_order_id: String,
    pub protective_order_list_id: Option<String>,
}

impl Position {
    /// A filled entry that still lacks protective orders
    pub fn pending(
        symbol: String,
        entry_price: f64,
        quantity: f64,
        levels: ProtectiveLevels,
        entry_order_id: String,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            entry_price,
            quantity,
            stop_loss_price: levels.stop_loss,
            take_profit_price: levels.take_profit,
            trailing_activation_price: levels.trailing_activation,
            trailing_stop_price: None,
            opened_at,
            status: PositionStatus::Pending,
            close_reason: None,
            exit_price: None,
            closed_at: None,
            realized_pnl: None,
            estimated_fees: None,
            entry_order_id,
            protective_order_list_id: None,
        }
    }

    /// PENDING -> OPEN once the exchange holds the protective orders
    pub fn mark_open(&mut self, protective_order_list_id: Option<String>) -> Result<(), PositionError> {
        if self.status != PositionStatus::Pending {
            return Err(PositionError::NotPending(self.id));
        }
        self.status = PositionStatus::Open;
        self.protective_order_list_id = protective_order_list_id;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.quantity
    }

    pub fn unrealized_pnl_pct(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Exit decision for a price update, without side effects.
    ///
    /// Precedence: take-profit, armed trailing stop, stop-loss, timeout,
    /// stagnation, then weak momentum when a reading is supplied.
    pub fn exit_reason_at(&self, current_price: f64, now: DateTime<Utc>, rules: &ExitRules) -> Option<CloseReason> {
        self.exit_reason_with(current_price, None, now, rules)
    }

    pub fn exit_reason_with(
        &self,
        current_price: f64,
        momentum: Option<&MomentumReading>,
        now: DateTime<Utc>,
        rules: &ExitRules,
    ) -> Option<CloseReason> {
        if !self.is_open() {
            return None;
        }

        if current_price >= self.take_profit_price {
            return Some(CloseReason::TakeProfit);
        }

        if let Some(trailing) = self.trailing_stop_price {
            if current_price <= trailing {
                return Some(CloseReason::TrailingStop);
            }
        }

        if current_price <= self.stop_loss_price {
            return Some(CloseReason::StopLoss);
        }

        let age = self.age_at(now);
        if age > rules.max_hold {
            return Some(CloseReason::Timeout);
        }

        let pnl_pct = self.unrealized_pnl_pct(current_price);
        if let Some(stagnation) = &rules.stagnation {
            if age > stagnation.after && (stagnation.low_pct..=stagnation.high_pct).contains(&pnl_pct) {
                return Some(CloseReason::Stagnation);
            }
        }

        if let (Some(rule), Some(reading)) = (&rules.momentum_exit, momentum) {
            if rule.applies(self, current_price, now) && rule.triggers(reading) {
                return Some(CloseReason::WeakMomentum);
            }
        }

        None
    }

    /// Arm or ratchet the trailing stop. Returns true when the level moved.
    pub fn update_trailing_stop(&mut self, current_price: f64, rules: &ExitRules) -> bool {
        if !self.is_open() || current_price < self.trailing_activation_price {
            return false;
        }

        let next = ratchet_trailing(self.trailing_stop_price, current_price, rules.trailing_distance_pct);
        let moved = self.trailing_stop_price.map_or(true, |prev| next > prev);
        self.trailing_stop_price = Some(next);
        moved
    }

    /// One supervision step: an exit reason, or else advance the trailing stop
    pub fn check_exit_at(&mut self, current_price: f64, now: DateTime<Utc>, rules: &ExitRules) -> Option<CloseReason> {
        self.check_exit_with(current_price, None, now, rules)
    }

    pub fn check_exit_with(
        &mut self,
        current_price: f64,
        momentum: Option<&MomentumReading>,
        now: DateTime<Utc>,
        rules: &ExitRules,
    ) -> Option<CloseReason> {
        if let Some(reason) = self.exit_reason_with(current_price, momentum, now, rules) {
            return Some(reason);
        }
        self.update_trailing_stop(current_price, rules);
        None
    }

    /// OPEN -> CLOSED. Returns the gross realized P&L.
    pub fn close_at(
        &mut self,
        exit_price: f64,
        reason: CloseReason,
        fee_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<f64, PositionError> {
        match self.status {
            PositionStatus::Closed => return Err(PositionError::AlreadyClosed(self.id)),
            PositionStatus::Pending => return Err(PositionError::NotOpen(self.id)),
            PositionStatus::Open => {}
        }

        let pnl = (exit_price - self.entry_price) * self.quantity;
        let fees = (self.entry_price + exit_price) * self.quantity * fee_rate;

        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.exit_price = Some(exit_price);
        self.closed_at = Some(now);
        self.realized_pnl = Some(pnl);
        self.estimated_fees = Some(fees);

        Ok(pnl)
    }

    /// Realized P&L after estimated fees
    pub fn net_pnl(&self) -> Option<f64> {
        Some(self.realized_pnl? - self.estimated_fees.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn open_position(rules: &ExitRules) -> Position {
        let mut p = Position::pending("BTCUSDC".to_string(), 100.0, 2.0, rules.levels(100.0), "1".to_string(), t0());
        p.mark_open(Some("oco-1".to_string())).unwrap();
        p
    }

    #[test]
    fn test_levels() {
        let levels = ExitRules::default().levels(100.0);
        assert_relative_eq!(levels.take_profit, 100.9, epsilon = 1e-9);
        assert_relative_eq!(levels.stop_loss, 99.6, epsilon = 1e-9);
        assert_relative_eq!(levels.trailing_activation, 100.5, epsilon = 1e-9);
    }

    #[test]
    fn test_pending_to_open_once() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.mark_open(None), Err(PositionError::NotPending(p.id)));
    }

    #[test]
    fn test_pending_never_exits() {
        let rules = ExitRules::default();
        let p = Position::pending("X".into(), 100.0, 1.0, rules.levels(100.0), "1".into(), t0());
        assert_eq!(p.exit_reason_at(50.0, t0(), &rules), None);
    }

    #[test]
    fn test_take_profit() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);
        assert_eq!(p.check_exit_at(100.95, t0(), &rules), Some(CloseReason::TakeProfit));
    }

    #[test]
    fn test_stop_loss() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);
        assert_eq!(p.check_exit_at(99.5, t0(), &rules), Some(CloseReason::StopLoss));
        assert_eq!(p.check_exit_at(99.7, t0(), &rules), None);
    }

    #[test]
    fn test_timeout() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);
        // above the stagnation band, below trailing activation
        assert_eq!(p.check_exit_at(100.3, t0() + Duration::minutes(45), &rules), None);
        assert_eq!(
            p.check_exit_at(100.3, t0() + Duration::minutes(46), &rules),
            Some(CloseReason::Timeout)
        );
    }

    #[test]
    fn test_timeout_precedes_stagnation() {
        let rules = ExitRules::default();
        let p = open_position(&rules);
        assert_eq!(
            p.exit_reason_at(100.1, t0() + Duration::minutes(46), &rules),
            Some(CloseReason::Timeout)
        );
    }

    #[test]
    fn test_stagnation_band() {
        let rules = ExitRules::default();
        let p = open_position(&rules);
        let later = t0() + Duration::minutes(16);

        assert_eq!(p.exit_reason_at(100.1, t0() + Duration::minutes(14), &rules), None);
        assert_eq!(p.exit_reason_at(100.1, later, &rules), Some(CloseReason::Stagnation));
        assert_eq!(p.exit_reason_at(99.9, later, &rules), Some(CloseReason::Stagnation));
        // outside the band on either side
        assert_eq!(p.exit_reason_at(100.3, later, &rules), None);
        assert_eq!(p.exit_reason_at(99.8, later, &rules), None);

        let disabled = ExitRules {
            stagnation: None,
            ..ExitRules::default()
        };
        assert_eq!(p.exit_reason_at(100.1, later, &disabled), None);
    }

    #[test]
    fn test_weak_momentum_cuts_losers_only() {
        let rules = ExitRules::default();
        let p = open_position(&rules);
        let weak = MomentumReading {
            rsi: 20.0,
            macd: -0.3,
            macd_signal: -0.1,
        };
        let later = t0() + Duration::minutes(6);

        assert_eq!(
            p.exit_reason_with(99.75, Some(&weak), later, &rules),
            Some(CloseReason::WeakMomentum)
        );
        // too early, not losing enough, or no reading
        assert_eq!(p.exit_reason_with(99.75, Some(&weak), t0() + Duration::minutes(4), &rules), None);
        assert_eq!(p.exit_reason_with(99.9, Some(&weak), later, &rules), None);
        assert_eq!(p.exit_reason_with(99.75, None, later, &rules), None);

        let recovering = MomentumReading { macd: 0.1, ..weak };
        assert_eq!(p.exit_reason_with(99.75, Some(&recovering), later, &rules), None);
    }

    #[test]
    fn test_momentum_reading_needs_history() {
        let rule = MomentumExitRule::default();
        assert!(rule.read(&[100.0; 20]).is_none());

        // accelerating sell-off
        let falling: Vec<f64> = (0..60).map(|i| 100.0 - 0.002 * (i * i) as f64).collect();
        let reading = rule.read(&falling).unwrap();
        assert!(reading.rsi < 25.0);
        assert!(reading.macd < reading.macd_signal);
    }

    #[test]
    fn test_trailing_arms_and_triggers() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);

        assert_eq!(p.check_exit_at(100.4, t0(), &rules), None);
        assert_eq!(p.trailing_stop_price, None);

        assert_eq!(p.check_exit_at(100.6, t0(), &rules), None);
        let armed = p.trailing_stop_price.unwrap();
        assert_relative_eq!(armed, 100.6 * 0.997, epsilon = 1e-9);

        // falls back under the trailing level but above the fixed stop
        assert_eq!(p.check_exit_at(100.2, t0(), &rules), Some(CloseReason::TrailingStop));
    }

    #[test]
    fn test_trailing_never_decreases() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);
        p.check_exit_at(100.8, t0(), &rules);
        let high = p.trailing_stop_price.unwrap();

        p.check_exit_at(100.55, t0(), &rules);
        assert_eq!(p.trailing_stop_price, Some(high));
    }

    #[test]
    fn test_ratchet_trailing() {
        assert_relative_eq!(ratchet_trailing(None, 100.0, 0.01), 99.0);
        assert_relative_eq!(ratchet_trailing(Some(99.5), 100.0, 0.01), 99.5);
        assert_relative_eq!(ratchet_trailing(Some(98.0), 100.0, 0.01), 99.0);
    }

    #[test]
    fn test_close_records_pnl_and_fees() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);

        let pnl = p.close_at(101.0, CloseReason::TakeProfit, 0.001, t0()).unwrap();
        assert_relative_eq!(pnl, 2.0, epsilon = 1e-9);
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.close_reason, Some(CloseReason::TakeProfit));
        assert_relative_eq!(p.estimated_fees.unwrap(), 0.402, epsilon = 1e-9);
        assert_relative_eq!(p.net_pnl().unwrap(), 1.598, epsilon = 1e-9);
    }

    #[test]
    fn test_cannot_close_twice() {
        let rules = ExitRules::default();
        let mut p = open_position(&rules);
        p.close_at(99.0, CloseReason::StopLoss, 0.0, t0()).unwrap();

        let err = p.close_at(101.0, CloseReason::Manual, 0.0, t0()).unwrap_err();
        assert_eq!(err, PositionError::AlreadyClosed(p.id));
        assert_eq!(p.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(p.exit_reason_at(50.0, t0(), &rules), None);
    }
}
