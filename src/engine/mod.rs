// Orchestration loop
pub mod orchestrator;

pub use orchestrator::{EngineSettings, Orchestrator, RunSummary, SymbolOutcome};
