use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Portfolio-wide entry limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_daily_trades: u32,
    pub max_daily_loss_usd: f64,
    pub max_loss_streak: u32,
    pub loss_pause_minutes: i64,
    pub max_trades_per_hour: u32,
    pub min_seconds_between_entries: i64,
    pub symbol_cooldown_seconds: i64,
    pub max_trades_per_pair_hour: u32,
    /// Stop entering for the day once net realized P&L reaches this. 0 disables.
    pub daily_profit_target_usd: f64,
    pub trading_hours_enabled: bool,
    pub trading_start_hour: u32, // UTC, inclusive
    pub trading_end_hour: u32,   // UTC, exclusive
    pub weekend_trading: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_trades: 20,
            max_daily_loss_usd: 200.0,
            max_loss_streak: 3,
            loss_pause_minutes: 60,
            max_trades_per_hour: 2,
            min_seconds_between_entries: 300,
            symbol_cooldown_seconds: 3600,
            max_trades_per_pair_hour: 2,
            daily_profit_target_usd: 0.0,
            trading_hours_enabled: false,
            trading_start_hour: 6,
            trading_end_hour: 22,
            weekend_trading: true,
        }
    }
}

impl RiskLimits {
    /// Whether `now` falls inside the configured trading window. A start hour
    /// after the end hour wraps past midnight.
    pub fn in_trading_hours(&self, now: DateTime<Utc>) -> bool {
        if !self.trading_hours_enabled {
            return true;
        }
        let hour = now.hour();
        if self.trading_start_hour <= self.trading_end_hour {
            (self.trading_start_hour..self.trading_end_hour).contains(&hour)
        } else {
            hour >= self.trading_start_hour || hour < self.trading_end_hour
        }
    }
}

/// Counters owned by the governor. Copies handed out by `snapshot()` are read-only views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub day: NaiveDate,
    pub daily_trade_count: u32,
    pub daily_realized_loss_usd: f64,
    pub consecutive_losses: u32,
    pub pause_until: Option<DateTime<Utc>>,
    pub hour_bucket: i64, // unix hour of the current hourly counter
    pub hourly_trade_count: u32,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub symbol_last_entry: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub symbol_hourly: HashMap<String, u32>, // entries per symbol in `hour_bucket`
    #[serde(default)]
    pub daily_realized_pnl_usd: f64,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            daily_trade_count: 0,
            daily_realized_loss_usd: 0.0,
            consecutive_losses: 0,
            pause_until: None,
            hour_bucket: hour_bucket(now),
            hourly_trade_count: 0,
            last_entry_at: None,
            symbol_last_entry: HashMap::new(),
            symbol_hourly: HashMap::new(),
            daily_realized_pnl_usd: 0.0,
        }
    }
}

/// Why a new entry was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskBlock {
    #[error("paused until {0}")]
    Paused(DateTime<Utc>),
    #[error("daily trade limit reached ({0})")]
    DailyTradeLimit(u32),
    #[error("daily loss limit reached (${0:.2})")]
    DailyLossLimit(f64),
    #[error("hourly trade limit reached ({0})")]
    HourlyTradeLimit(u32),
    #[error("last entry {0}s ago, minimum spacing not elapsed")]
    EntrySpacing(i64),
    #[error("{0} in cooldown until {1}")]
    SymbolCooldown(String, DateTime<Utc>),
    #[error("{0} reached its hourly trade limit ({1})")]
    SymbolHourlyLimit(String, u32),
    #[error("daily profit target reached (${0:.2})")]
    DailyTargetReached(f64),
    #[error("outside trading hours")]
    OutsideTradingHours,
    #[error("weekend trading disabled")]
    Weekend,
    #[error("entry already in progress for {0}")]
    EntryInProgress(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PauseReason {
    LossStreak(u32),
    DailyLossLimit(f64),
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::LossStreak(n) => write!(f, "{} consecutive losses", n),
            PauseReason::DailyLossLimit(loss) => write!(f, "daily loss ${:.2}", loss),
        }
    }
}

/// A pause that `record_close` just put in place
#[derive(Debug, Clone, PartialEq)]
pub struct RiskPause {
    pub reason: PauseReason,
    pub until: DateTime<Utc>,
}

struct Inner {
    state: RiskState,
    pending_entries: u32,
    pending_symbols: HashSet<String>,
}

/// Single owner of the portfolio risk counters.
///
/// Entries in flight hold an `EntryPermit` so concurrent workers cannot
/// overshoot the daily or hourly caps between the gate check and the fill.
pub struct RiskGovernor {
    limits: RiskLimits,
    inner: Mutex<Inner>,
}

impl RiskGovernor {
    pub fn new(limits: RiskLimits) -> Self {
        Self::with_state(limits, RiskState::new(Utc::now()))
    }

    /// Restore counters from a saved snapshot
    pub fn with_state(limits: RiskLimits, state: RiskState) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner {
                state,
                pending_entries: 0,
                pending_symbols: HashSet::new(),
            }),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> RiskState {
        self.lock().state.clone()
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.lock().state.consecutive_losses
    }

    /// Reset counters if the UTC date changed. Returns true when a reset happened.
    pub fn rollover_if_new_day(&self) -> bool {
        self.rollover_if_new_day_at(Utc::now())
    }

    pub fn rollover_if_new_day_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        Self::rollover(&mut inner.state, now)
    }

    fn rollover(state: &mut RiskState, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today == state.day {
            return false;
        }

        tracing::info!(
            "New trading day {} (previous: {} trades, ${:.2} realized loss)",
            today,
            state.daily_trade_count,
            state.daily_realized_loss_usd
        );

        let symbol_last_entry = std::mem::take(&mut state.symbol_last_entry);
        let last_entry_at = state.last_entry_at;
        *state = RiskState::new(now);
        // Spacing and cooldowns are time based, not day based
        state.symbol_last_entry = symbol_last_entry;
        state.last_entry_at = last_entry_at;
        true
    }

    pub fn can_open(&self) -> bool {
        self.can_open_at(Utc::now()).is_ok()
    }

    /// Portfolio-wide gate, counting entries that are still in flight
    pub fn can_open_at(&self, now: DateTime<Utc>) -> Result<(), RiskBlock> {
        let mut inner = self.lock();
        Self::rollover(&mut inner.state, now);
        self.check_global(&inner, now)
    }

    fn check_global(&self, inner: &Inner, now: DateTime<Utc>) -> Result<(), RiskBlock> {
        let state = &inner.state;

        if let Some(until) = state.pause_until {
            if now < until {
                return Err(RiskBlock::Paused(until));
            }
        }

        if !self.limits.weekend_trading && matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err(RiskBlock::Weekend);
        }

        if !self.limits.in_trading_hours(now) {
            return Err(RiskBlock::OutsideTradingHours);
        }

        if self.limits.daily_profit_target_usd > 0.0
            && state.daily_realized_pnl_usd >= self.limits.daily_profit_target_usd
        {
            return Err(RiskBlock::DailyTargetReached(state.daily_realized_pnl_usd));
        }

        if state.daily_trade_count + inner.pending_entries >= self.limits.max_daily_trades {
            return Err(RiskBlock::DailyTradeLimit(self.limits.max_daily_trades));
        }

        if state.daily_realized_loss_usd >= self.limits.max_daily_loss_usd {
            return Err(RiskBlock::DailyLossLimit(state.daily_realized_loss_usd));
        }

        let hourly = if state.hour_bucket == hour_bucket(now) {
            state.hourly_trade_count
        } else {
            0
        };
        if hourly + inner.pending_entries >= self.limits.max_trades_per_hour {
            return Err(RiskBlock::HourlyTradeLimit(self.limits.max_trades_per_hour));
        }

        if let Some(last) = state.last_entry_at {
            let elapsed = (now - last).num_seconds();
            if elapsed < self.limits.min_seconds_between_entries {
                return Err(RiskBlock::EntrySpacing(elapsed));
            }
        }

        Ok(())
    }

    /// Reserve the right to open a position on `symbol`.
    ///
    /// The permit counts toward every cap until it is committed (the entry
    /// filled) or dropped (the entry was abandoned).
    pub fn try_begin_entry(self: &Arc<Self>, symbol: &str) -> Result<EntryPermit, RiskBlock> {
        self.try_begin_entry_at(symbol, Utc::now())
    }

    pub fn try_begin_entry_at(
        self: &Arc<Self>,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<EntryPermit, RiskBlock> {
        let mut inner = self.lock();
        Self::rollover(&mut inner.state, now);
        self.check_global(&inner, now)?;

        if inner.pending_symbols.contains(symbol) {
            return Err(RiskBlock::EntryInProgress(symbol.to_string()));
        }

        if let Some(last) = inner.state.symbol_last_entry.get(symbol) {
            let until = *last + Duration::seconds(self.limits.symbol_cooldown_seconds);
            if now < until {
                return Err(RiskBlock::SymbolCooldown(symbol.to_string(), until));
            }
        }

        if inner.state.hour_bucket == hour_bucket(now) {
            let count = inner.state.symbol_hourly.get(symbol).copied().unwrap_or(0);
            if count >= self.limits.max_trades_per_pair_hour {
                return Err(RiskBlock::SymbolHourlyLimit(
                    symbol.to_string(),
                    self.limits.max_trades_per_pair_hour,
                ));
            }
        }

        inner.pending_entries += 1;
        inner.pending_symbols.insert(symbol.to_string());

        Ok(EntryPermit {
            governor: Arc::clone(self),
            symbol: symbol.to_string(),
            active: true,
        })
    }

    /// Count a filled entry
    pub fn record_open(&self, symbol: &str) {
        self.record_open_at(symbol, Utc::now())
    }

    pub fn record_open_at(&self, symbol: &str, now: DateTime<Utc>) {
        let mut inner = self.lock();
        Self::count_open(&mut inner, symbol, now);
    }

    fn count_open(inner: &mut Inner, symbol: &str, now: DateTime<Utc>) {
        Self::rollover(&mut inner.state, now);
        let state = &mut inner.state;

        let bucket = hour_bucket(now);
        if state.hour_bucket != bucket {
            state.hour_bucket = bucket;
            state.hourly_trade_count = 0;
            state.symbol_hourly.clear();
        }

        state.daily_trade_count += 1;
        state.hourly_trade_count += 1;
        *state.symbol_hourly.entry(symbol.to_string()).or_insert(0) += 1;
        state.last_entry_at = Some(now);
        state.symbol_last_entry.insert(symbol.to_string(), now);
    }

    /// Record a closed position's realized P&L. Returns the pause this close triggered, if any.
    pub fn record_close(&self, realized_pnl: f64) -> Option<RiskPause> {
        self.record_close_at(realized_pnl, Utc::now())
    }

    pub fn record_close_at(&self, realized_pnl: f64, now: DateTime<Utc>) -> Option<RiskPause> {
        let mut inner = self.lock();
        Self::rollover(&mut inner.state, now);
        let state = &mut inner.state;

        let target = self.limits.daily_profit_target_usd;
        let before = state.daily_realized_pnl_usd;
        state.daily_realized_pnl_usd += realized_pnl;
        if target > 0.0 && before < target && state.daily_realized_pnl_usd >= target {
            tracing::info!(
                "🎯 Daily profit target ${:.2} reached (${:.2}), no new entries today",
                target,
                state.daily_realized_pnl_usd
            );
        }

        if realized_pnl < 0.0 {
            state.consecutive_losses += 1;
            state.daily_realized_loss_usd += -realized_pnl;
        } else {
            state.consecutive_losses = 0;
        }

        let reason = if state.daily_realized_loss_usd >= self.limits.max_daily_loss_usd {
            PauseReason::DailyLossLimit(state.daily_realized_loss_usd)
        } else if state.consecutive_losses >= self.limits.max_loss_streak {
            PauseReason::LossStreak(state.consecutive_losses)
        } else {
            return None;
        };

        // Only a losing close can start a pause
        if realized_pnl >= 0.0 {
            return None;
        }

        let until = now + Duration::minutes(self.limits.loss_pause_minutes);
        state.pause_until = Some(until);
        tracing::warn!("Risk pause until {}: {}", until.format("%H:%M:%S"), reason);

        Some(RiskPause { reason, until })
    }

    fn release_pending(&self, symbol: &str) {
        let mut inner = self.lock();
        Self::clear_pending(&mut inner, symbol);
    }

    // One critical section, so no other entry slips in between release and count
    fn commit_pending(&self, symbol: &str, now: DateTime<Utc>) {
        let mut inner = self.lock();
        Self::clear_pending(&mut inner, symbol);
        Self::count_open(&mut inner, symbol, now);
    }

    fn clear_pending(inner: &mut Inner, symbol: &str) {
        inner.pending_entries = inner.pending_entries.saturating_sub(1);
        inner.pending_symbols.remove(symbol);
    }
}

/// Pending-entry reservation released on drop unless committed
pub struct EntryPermit {
    governor: Arc<RiskGovernor>,
    symbol: String,
    active: bool,
}

impl EntryPermit {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// The entry filled: turn the reservation into counted trades
    pub fn commit(self) {
        self.commit_at(Utc::now())
    }

    pub fn commit_at(mut self, now: DateTime<Utc>) {
        self.active = false;
        self.governor.commit_pending(&self.symbol, now);
    }
}

impl Drop for EntryPermit {
    fn drop(&mut self) {
        if self.active {
            self.governor.release_pending(&self.symbol);
        }
    }
}

fn hour_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(3600)
}
