// Risk management module
pub mod governor;

pub use governor::{
    EntryPermit, PauseReason, RiskBlock, RiskGovernor, RiskLimits, RiskPause, RiskState,
};
