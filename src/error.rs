use std::time::Duration;

use thiserror::Error;

/// Failures reported by an exchange adapter
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::Timeout(_) | ExchangeError::RateLimited { .. }
        )
    }

    /// The request may have reached the exchange even though no answer came back
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::Timeout(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndicatorError {
    #[error("insufficient data: need {required} candles, got {available}")]
    InsufficientData { required: usize, available: usize },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PositionError {
    #[error("position {0} is already closed")]
    AlreadyClosed(uuid::Uuid),

    #[error("position {0} is not pending")]
    NotPending(uuid::Uuid),

    #[error("position {0} is not open")]
    NotOpen(uuid::Uuid),
}

/// Per-symbol failures surfaced by the engine. None of these abort the loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Indicator(#[from] IndicatorError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error("protective orders failed for {symbol} (entry unwound: {unwound}): {source}")]
    ProtectiveOrderFailure {
        symbol: String,
        unwound: bool,
        #[source]
        source: ExchangeError,
    },

    #[error("entry refused: {0}")]
    EntryRefused(String),

    #[error("rejected market data: {0}")]
    DataQuality(String),

    #[error("symbol worker failed: {0}")]
    WorkerFailed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
