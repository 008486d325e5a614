// Circuit state and transition table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Blocking all requests after repeated failures
    Open,
    /// Trial mode - requests pass through to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed limits the transition table is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

/// Events that may move the breaker to another state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A failure was recorded; carries the updated run of consecutive errors
    Failure { consecutive_errors: u32 },
    /// A success was recorded; carries the updated run of consecutive successes
    Success { consecutive_successes: u32 },
    /// Monitoring tick; carries time spent in the current state
    Elapsed(Duration),
    /// Administrative kill switch
    ForceOpen,
    /// Confirmed administrative reset
    Reset,
}

/// Compute the state a trigger leads to, or `None` if the breaker stays put.
///
/// `ForceOpen` and `Reset` always return a state, even when it equals the
/// current one, so that the state timer restarts.
pub fn next_state(
    current: CircuitState,
    trigger: &Trigger,
    thresholds: &Thresholds,
) -> Option<CircuitState> {
    use CircuitState::*;

    match (current, trigger) {
        (_, Trigger::ForceOpen) => Some(Open),
        (_, Trigger::Reset) => Some(Closed),

        (Closed, Trigger::Failure { consecutive_errors })
            if *consecutive_errors >= thresholds.failure_threshold =>
        {
            Some(Open)
        }
        // Any failure during trial mode reopens the circuit
        (HalfOpen, Trigger::Failure { .. }) => Some(Open),

        (HalfOpen, Trigger::Success { consecutive_successes })
            if *consecutive_successes >= thresholds.success_threshold =>
        {
            Some(Closed)
        }

        (Open, Trigger::Elapsed(elapsed)) if *elapsed >= thresholds.recovery_timeout => {
            Some(HalfOpen)
        }

        _ => None,
    }
}

/// A state change that was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

impl Transition {
    /// True when the breaker moved into Open from another state
    pub fn opened(&self) -> bool {
        self.to == CircuitState::Open && self.from != CircuitState::Open
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Current state plus the time it was entered
#[derive(Debug, Clone)]
pub struct CircuitStateMachine {
    state: CircuitState,
    state_change_time: DateTime<Utc>,
    thresholds: Thresholds,
}

impl CircuitStateMachine {
    pub fn new(thresholds: Thresholds, now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            state_change_time: now,
            thresholds,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn state_change_time(&self) -> DateTime<Utc> {
        self.state_change_time
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Time spent in the current state. Zero if the clock moved backwards.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> Duration {
        (now - self.state_change_time).to_std().unwrap_or(Duration::ZERO)
    }

    /// Evaluate a trigger and apply the resulting transition, if any
    pub fn fire(&mut self, trigger: Trigger, now: DateTime<Utc>) -> Option<Transition> {
        let to = next_state(self.state, &trigger, &self.thresholds)?;
        let from = self.state;

        self.state = to;
        self.state_change_time = now;

        Some(Transition { from, to, at: now })
    }

    /// Check whether the recovery timeout has elapsed in Open
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let elapsed = self.time_in_state(now);
        self.fire(Trigger::Elapsed(elapsed), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn thresholds() -> Thresholds {
        Thresholds {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_closed_opens_at_failure_threshold() {
        let t = thresholds();
        let below = Trigger::Failure { consecutive_errors: 4 };
        let at = Trigger::Failure { consecutive_errors: 5 };

        assert_eq!(next_state(CircuitState::Closed, &below, &t), None);
        assert_eq!(
            next_state(CircuitState::Closed, &at, &t),
            Some(CircuitState::Open)
        );
    }

    #[test]
    fn test_half_open_reopens_on_first_failure() {
        let trigger = Trigger::Failure { consecutive_errors: 1 };
        assert_eq!(
            next_state(CircuitState::HalfOpen, &trigger, &thresholds()),
            Some(CircuitState::Open)
        );
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let t = thresholds();
        let two = Trigger::Success { consecutive_successes: 2 };
        let three = Trigger::Success { consecutive_successes: 3 };

        assert_eq!(next_state(CircuitState::HalfOpen, &two, &t), None);
        assert_eq!(
            next_state(CircuitState::HalfOpen, &three, &t),
            Some(CircuitState::Closed)
        );
    }

    #[test]
    fn test_successes_do_not_move_closed_or_open() {
        let trigger = Trigger::Success { consecutive_successes: 10 };
        assert_eq!(next_state(CircuitState::Closed, &trigger, &thresholds()), None);
        assert_eq!(next_state(CircuitState::Open, &trigger, &thresholds()), None);
    }

    #[test]
    fn test_failures_keep_open_open() {
        let trigger = Trigger::Failure { consecutive_errors: 50 };
        assert_eq!(next_state(CircuitState::Open, &trigger, &thresholds()), None);
    }

    #[test]
    fn test_open_moves_to_half_open_after_timeout() {
        let t = thresholds();
        let early = Trigger::Elapsed(Duration::from_secs(299));
        let due = Trigger::Elapsed(Duration::from_secs(300));

        assert_eq!(next_state(CircuitState::Open, &early, &t), None);
        assert_eq!(
            next_state(CircuitState::Open, &due, &t),
            Some(CircuitState::HalfOpen)
        );
        // The timer only matters while open
        assert_eq!(next_state(CircuitState::Closed, &due, &t), None);
    }

    #[test]
    fn test_force_open_and_reset_apply_from_every_state() {
        let t = thresholds();
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(
                next_state(state, &Trigger::ForceOpen, &t),
                Some(CircuitState::Open)
            );
            assert_eq!(
                next_state(state, &Trigger::Reset, &t),
                Some(CircuitState::Closed)
            );
        }
    }

    #[test]
    fn test_fire_updates_state_change_time() {
        let start = Utc::now();
        let mut machine = CircuitStateMachine::new(thresholds(), start);
        let later = start + ChronoDuration::seconds(42);

        let transition = machine.fire(Trigger::ForceOpen, later).unwrap();

        assert!(transition.opened());
        assert_eq!(machine.state(), CircuitState::Open);
        assert_eq!(machine.state_change_time(), later);
    }

    #[test]
    fn test_check_timeout_uses_time_in_state() {
        let start = Utc::now();
        let mut machine = CircuitStateMachine::new(thresholds(), start);
        machine.fire(Trigger::ForceOpen, start);

        assert!(machine
            .check_timeout(start + ChronoDuration::seconds(120))
            .is_none());

        let transition = machine
            .check_timeout(start + ChronoDuration::seconds(301))
            .unwrap();
        assert_eq!(transition.from, CircuitState::Open);
        assert_eq!(transition.to, CircuitState::HalfOpen);
    }

    #[test]
    fn test_serializes_as_upper_snake_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
    }
}
