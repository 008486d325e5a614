// Core modules
pub mod api;
pub mod breaker;
pub mod config;
pub mod emergency;
pub mod error;

// Re-export commonly used types
pub use crate::breaker::{BreakerStatus, CircuitBreaker, CircuitState, RequestGate};
pub use crate::config::BreakerConfig;
pub use crate::emergency::{EmergencyStop, EmergencyStopManager, NoopEmergencyStop};
pub use crate::error::{BreakerError, CircuitOpenError};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
