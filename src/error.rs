use std::time::Duration;
use thiserror::Error;

/// Returned by the request gate when the breaker denies admission.
///
/// The wrapped operation is never invoked when this is produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit breaker rejected request: {reason}")]
pub struct CircuitOpenError {
    pub reason: String,
}

impl CircuitOpenError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors raised by breaker setup and lifecycle management
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("monitoring task failed: {0}")]
    MonitorJoin(#[from] tokio::task::JoinError),

    #[error("monitoring task did not stop within {0:?}")]
    MonitorStopTimeout(Duration),
}
