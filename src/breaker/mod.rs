// Global API circuit breaker
pub mod circuit_breaker;
pub mod clock;
pub mod gate;
pub mod monitor;
pub mod state;
pub mod stats;

pub use circuit_breaker::{BreakerStatus, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gate::RequestGate;
pub use state::{CircuitState, CircuitStateMachine, Thresholds, Transition, Trigger};
pub use stats::ErrorStats;
