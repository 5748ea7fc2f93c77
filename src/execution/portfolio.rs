use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::position::{Position, PositionStatus};

/// Closed positions kept in memory; older ones live only in the store
const CLOSED_HISTORY: usize = 500;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortfolioBlock {
    #[error("already have open position for {0}")]
    AlreadyOpen(String),
    #[error("entry already in progress for {0}")]
    EntryInProgress(String),
    #[error("max open positions reached ({0})")]
    Full(usize),
}

struct Inner {
    open: HashMap<String, Position>,
    reserved: HashSet<String>,
    closed: VecDeque<Position>,
    total_pnl: f64,
}

/// At most one position per symbol, at most `max_open` positions overall.
///
/// Entries in flight hold a `SlotReservation`, so the slot check and the
/// insert of the resulting position are atomic with respect to other workers.
pub struct Portfolio {
    max_open: usize,
    inner: Mutex<Inner>,
}

impl Portfolio {
    pub fn new(max_open: usize) -> Self {
        Self::with_positions(max_open, Vec::new())
    }

    /// Restore open positions from persistence
    pub fn with_positions(max_open: usize, positions: Vec<Position>) -> Self {
        let open: HashMap<String, Position> = positions
            .into_iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| (p.symbol.clone(), p))
            .collect();

        if !open.is_empty() {
            tracing::info!("Restored {} open positions from persistence", open.len());
        }

        Self {
            max_open,
            inner: Mutex::new(Inner {
                open,
                reserved: HashSet::new(),
                closed: VecDeque::new(),
                total_pnl: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Check if we have open position for symbol
    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.lock().open.contains_key(symbol)
    }

    pub fn get_open_position(&self, symbol: &str) -> Option<Position> {
        self.lock().open.get(symbol).cloned()
    }

    /// Get all open positions
    pub fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.lock().open.values().cloned().collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        positions
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    /// Open positions plus entries in flight
    pub fn occupied_slots(&self) -> usize {
        let inner = self.lock();
        inner.open.len() + inner.reserved.len()
    }

    /// Most recent closes, oldest first
    pub fn closed_positions(&self) -> Vec<Position> {
        self.lock().closed.iter().cloned().collect()
    }

    /// Get total realized P&L of positions closed in this session, including
    /// those aged out of the in-memory history
    pub fn total_pnl(&self) -> f64 {
        self.lock().total_pnl
    }

    /// Claim the slot for `symbol`. Dropping the reservation frees it again.
    pub fn try_reserve(self: &Arc<Self>, symbol: &str) -> Result<SlotReservation, PortfolioBlock> {
        let mut inner = self.lock();

        if inner.open.contains_key(symbol) {
            return Err(PortfolioBlock::AlreadyOpen(symbol.to_string()));
        }
        if inner.reserved.contains(symbol) {
            return Err(PortfolioBlock::EntryInProgress(symbol.to_string()));
        }
        if inner.open.len() + inner.reserved.len() >= self.max_open {
            return Err(PortfolioBlock::Full(self.max_open));
        }

        inner.reserved.insert(symbol.to_string());
        Ok(SlotReservation {
            portfolio: Arc::clone(self),
            symbol: symbol.to_string(),
            active: true,
        })
    }

    /// Mutate the open position for `symbol` under the portfolio lock
    pub fn with_open_position<R, F>(&self, symbol: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Position) -> R,
    {
        self.lock().open.get_mut(symbol).map(f)
    }

    /// Move a closed position from the open map to the archive
    pub fn archive(&self, position: Position) {
        let mut inner = self.lock();
        inner.open.remove(&position.symbol);
        inner.total_pnl += position.realized_pnl.unwrap_or(0.0);
        inner.closed.push_back(position);
        while inner.closed.len() > CLOSED_HISTORY {
            inner.closed.pop_front();
        }
    }

    /// Forget an open position without archiving it (it closed while we were away)
    pub fn discard(&self, symbol: &str) -> Option<Position> {
        self.lock().open.remove(symbol)
    }

    fn release(&self, symbol: &str) {
        self.lock().reserved.remove(symbol);
    }

    fn fill(&self, symbol: &str, position: Position) {
        let mut inner = self.lock();
        inner.reserved.remove(symbol);
        inner.open.insert(symbol.to_string(), position);
    }
}

/// Slot held for an entry in flight
pub struct SlotReservation {
    portfolio: Arc<Portfolio>,
    symbol: String,
    active: bool,
}

impl SlotReservation {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Install the now-open position in the reserved slot
    pub fn commit(mut self, position: Position) {
        self.active = false;
        self.portfolio.fill(&self.symbol, position);
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.active {
            self.portfolio.release(&self.symbol);
        }
    }
}
