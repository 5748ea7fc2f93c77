// Order execution and position supervision module
pub mod executor;
pub mod portfolio;
pub mod position;
pub mod price_feed;
pub mod retry;
pub mod supervisor;

pub use executor::{ExecutionAction, ExecutionDecision, Executor, SizingRules};
pub use portfolio::{Portfolio, PortfolioBlock, SlotReservation};
pub use position::{
    ratchet_trailing, CloseReason, ExitRules, MomentumExitRule, MomentumReading, Position, PositionStatus,
    ProtectiveLevels, StagnationRule,
};
pub use price_feed::{interval_seconds, MarketFeed};
pub use retry::{with_retry, Attempt, RetryPolicy};
pub use supervisor::{EntryOutcome, PositionSupervisor, SupervisionOutcome};
