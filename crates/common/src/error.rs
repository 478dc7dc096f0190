use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Insufficient history: have {have} bars, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    #[error("Invalid sizing: {0}")]
    InvalidSizing(String),

    #[error("Broker connectivity error: {0}")]
    BrokerConnectivity(String),

    #[error("Broker call timed out: {0}")]
    Timeout(String),

    #[error("Broker rate limit hit: {0}")]
    RateLimited(String),

    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("Trading halted for the day by the risk governor")]
    RiskHalted,

    #[error("Out-of-order bar: {got} is not after {previous}")]
    OutOfOrderBar {
        previous: DateTime<Utc>,
        got: DateTime<Utc>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient broker failures that the retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BrokerConnectivity(_) | Error::Timeout(_) | Error::RateLimited(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
