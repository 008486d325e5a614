// Global API circuit breaker

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::clock::{Clock, SystemClock};
use super::monitor::MonitorHandle;
use super::state::{CircuitState, CircuitStateMachine, Thresholds, Transition, Trigger};
use super::stats::ErrorStats;
use crate::config::BreakerConfig;
use crate::emergency::EmergencyStop;
use crate::error::BreakerError;

/// Point-in-time view of the breaker, as returned by [`CircuitBreaker::get_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub error_rate_1min: f64,
    pub error_rate_5min: f64,
    pub last_error_time: Option<DateTime<Utc>>,
    pub state_change_time: DateTime<Utc>,
    pub failure_threshold: u32,
    /// Seconds
    pub recovery_timeout: u64,
    pub monitoring_active: bool,
}

/// Recover the guard from a poisoned mutex.
///
/// The protected data is plain counters and timestamps, which stay
/// internally consistent even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One instance guards all outgoing exchange traffic. It blocks every request
/// once `failure_threshold` consecutive errors are seen and reopens for trial
/// traffic after `recovery_timeout`.
///
/// Locking: `stats` is the outer lock and `machine` the inner one. Any path
/// that needs both takes `stats` first. `can_execute_request` only takes
/// `machine`; the consecutive error count it reports is mirrored into an
/// atomic written while both locks are held. Emergency stop hooks run after both
/// locks are released.
pub struct CircuitBreaker {
    config: BreakerConfig,
    /// Validated copy of `config.error_window()`
    error_window: chrono::Duration,
    clock: Arc<dyn Clock>,
    emergency: Arc<dyn EmergencyStop>,
    /// Outer lock
    stats: Mutex<ErrorStats>,
    /// Inner lock
    machine: Mutex<CircuitStateMachine>,
    /// Copy of `stats.consecutive_errors`, written with both locks held
    consecutive_errors: AtomicU32,
    pub(super) monitor: Mutex<Option<MonitorHandle>>,
}

impl CircuitBreaker {
    /// Create a breaker that reads real time
    pub fn new(
        config: BreakerConfig,
        emergency: Arc<dyn EmergencyStop>,
    ) -> Result<Self, BreakerError> {
        Self::with_clock(config, emergency, Arc::new(SystemClock))
    }

    /// Create a breaker with an injected time source
    pub fn with_clock(
        config: BreakerConfig,
        emergency: Arc<dyn EmergencyStop>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BreakerError> {
        config.validate()?;
        let error_window = chrono::Duration::from_std(config.error_window())
            .map_err(|e| BreakerError::InvalidConfig(format!("error_window_secs: {}", e)))?;

        let thresholds = Thresholds {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            recovery_timeout: config.recovery_timeout(),
        };
        let machine = CircuitStateMachine::new(thresholds, clock.now());

        tracing::info!(
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            recovery_timeout_secs = config.recovery_timeout_secs,
            "🔌 Circuit breaker initialized"
        );

        Ok(Self {
            config,
            error_window,
            clock,
            emergency,
            stats: Mutex::new(ErrorStats::new()),
            machine: Mutex::new(machine),
            consecutive_errors: AtomicU32::new(0),
            monitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.machine).state()
    }

    /// Whether a request may be sent right now, and why.
    ///
    /// Trial mode admits every caller until the first failure reopens the circuit.
    pub fn can_execute_request(&self) -> (bool, String) {
        // Read the count under the guard so state and count form one snapshot
        let machine = lock(&self.machine);
        let state = machine.state();
        let consecutive_errors = self.consecutive_errors.load(Ordering::Acquire);
        drop(machine);

        let decision = match state {
            CircuitState::Closed => (true, "normal operation".to_string()),
            CircuitState::Open => (
                false,
                format!("circuit open: {} consecutive errors", consecutive_errors),
            ),
            CircuitState::HalfOpen => (true, "trial mode".to_string()),
        };

        tracing::debug!(state = %state, allowed = decision.0, "Admission check");
        decision
    }

    /// Record a successful API call
    pub fn record_success(&self) {
        let transition = {
            let mut stats = lock(&self.stats);
            let consecutive_successes = stats.record_success();

            let mut machine = lock(&self.machine);
            self.consecutive_errors.store(0, Ordering::Release);
            let transition = machine.fire(
                Trigger::Success {
                    consecutive_successes,
                },
                self.clock.now(),
            );
            if transition.is_some() {
                // Start counting afresh once recovered
                stats.consecutive_successes = 0;
            }
            transition
        };

        if let Some(transition) = transition {
            self.after_transition(&transition, "trial calls succeeded");
        }
    }

    /// Record a failed API call, labelled with the kind of failure for the logs
    pub fn record_failure(&self, error_kind: &str) {
        let (consecutive_errors, transition) = {
            let mut stats = lock(&self.stats);
            let now = self.clock.now();
            let consecutive_errors = stats.record_failure(now);

            let mut machine = lock(&self.machine);
            self.consecutive_errors
                .store(consecutive_errors, Ordering::Release);
            let transition = machine.fire(Trigger::Failure { consecutive_errors }, now);
            (consecutive_errors, transition)
        };

        tracing::warn!(
            kind = error_kind,
            "⚠️ API error #{}: {}",
            consecutive_errors,
            error_kind
        );

        if let Some(transition) = transition {
            let context = match transition.from {
                CircuitState::HalfOpen => "failure during trial mode".to_string(),
                _ => format!("{} consecutive errors", consecutive_errors),
            };
            self.after_transition(&transition, &context);
        }
    }

    /// Open the circuit unconditionally (administrative kill switch)
    pub fn force_open(&self, reason: &str) {
        let transition = lock(&self.machine).fire(Trigger::ForceOpen, self.clock.now());

        tracing::error!(reason, "🚨 Circuit breaker FORCED OPEN: {}", reason);

        if let Some(transition) = transition {
            self.after_transition(&transition, reason);
        }
    }

    /// Clear all statistics and close the circuit.
    ///
    /// Does nothing and returns `false` unless `confirmed` is set.
    pub fn reset(&self, confirmed: bool) -> bool {
        if !confirmed {
            tracing::warn!("⚠️ Circuit breaker reset attempted without confirmation");
            return false;
        }

        let transition = {
            let mut stats = lock(&self.stats);
            *stats = ErrorStats::new();

            let mut machine = lock(&self.machine);
            self.consecutive_errors.store(0, Ordering::Release);
            machine.fire(Trigger::Reset, self.clock.now())
        };

        if let Some(transition) = transition {
            self.after_transition(&transition, "administrative reset");
        }
        tracing::warn!("🔄 Circuit breaker RESET by administrator");
        true
    }

    /// One monitoring pass: prune old errors, refresh rates, check the recovery timer
    pub fn monitor_tick(&self) -> Option<Transition> {
        let (pruned, transition) = {
            let mut stats = lock(&self.stats);
            let now = self.clock.now();
            let pruned = stats.refresh(now, self.error_window);

            let mut machine = lock(&self.machine);
            (pruned, machine.check_timeout(now))
        };

        tracing::debug!(pruned, "Circuit breaker monitoring tick");

        if let Some(transition) = &transition {
            self.after_transition(transition, "recovery timeout elapsed");
        }
        transition
    }

    pub fn get_status(&self) -> BreakerStatus {
        let monitoring_active = self.is_monitoring();

        let stats = lock(&self.stats);
        let machine = lock(&self.machine);

        BreakerStatus {
            state: machine.state(),
            total_errors: stats.total_errors,
            consecutive_errors: stats.consecutive_errors,
            consecutive_successes: stats.consecutive_successes,
            error_rate_1min: stats.error_rate_1min,
            error_rate_5min: stats.error_rate_5min,
            last_error_time: stats.last_error_time,
            state_change_time: machine.state_change_time(),
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout_secs,
            monitoring_active,
        }
    }

    /// Health summary for dashboards and readiness probes
    pub fn get_health_check(&self) -> (bool, String) {
        let stats = lock(&self.stats);
        let state = lock(&self.machine).state();

        match state {
            CircuitState::Closed if stats.error_rate_1min > self.config.elevated_error_rate => (
                false,
                format!(
                    "elevated error rate: {} errors/min",
                    stats.error_rate_1min
                ),
            ),
            CircuitState::Closed => (true, "nominal".to_string()),
            CircuitState::HalfOpen => (false, "trial mode".to_string()),
            CircuitState::Open => (
                false,
                format!("blocked: {} consecutive errors", stats.consecutive_errors),
            ),
        }
    }

    /// Tell the emergency stop about a successful call
    pub(crate) fn notify_success(&self) {
        self.notify("report_api_success", || self.emergency.report_api_success());
    }

    fn after_transition(&self, transition: &Transition, context: &str) {
        log_transition(transition, context);

        if transition.opened() {
            self.notify("report_api_error", || self.emergency.report_api_error());
        }
    }

    /// Run a collaborator hook, keeping its errors and panics away from the breaker
    fn notify<F>(&self, hook: &'static str, f: F)
    where
        F: FnOnce() -> crate::Result<()>,
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(hook, "Emergency stop notification failed: {}", e);
            }
            Err(_) => {
                tracing::error!(hook, "Emergency stop notification panicked");
            }
        }
    }
}

fn log_transition(transition: &Transition, context: &str) {
    let from = transition.from;
    let to = transition.to;

    if !transition.changed() {
        tracing::warn!("🔌 Circuit breaker stays {} ({}), timer restarted", to, context);
        return;
    }

    match to {
        CircuitState::Open => {
            tracing::error!(%from, %to, "🔴 Circuit breaker OPEN: {} → {} ({})", from, to, context);
        }
        CircuitState::HalfOpen => {
            tracing::warn!(%from, %to, "🔶 Circuit breaker: {} → {} ({})", from, to, context);
        }
        CircuitState::Closed => {
            tracing::info!(%from, %to, "✅ Circuit breaker: {} → {} ({})", from, to, context);
        }
    }
}
