use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::EmergencyStop;
use crate::Result;

const API_ERRORS: &str = "api_errors";
const CONSECUTIVE_LOSSES: &str = "consecutive_losses";

/// A single kill-switch condition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyCondition {
    pub name: String,
    pub threshold: u32,
    pub current_value: u32,
    pub triggered: bool,
    pub trigger_time: Option<DateTime<Utc>>,
}

impl EmergencyCondition {
    fn new(name: &str, threshold: u32) -> Self {
        Self {
            name: name.to_string(),
            threshold,
            current_value: 0,
            triggered: false,
            trigger_time: None,
        }
    }

    /// Update the observed value and latch the trigger once the threshold is hit
    fn observe(&mut self, value: u32, now: DateTime<Utc>) -> bool {
        self.current_value = value;
        if !self.triggered && value >= self.threshold {
            self.triggered = true;
            self.trigger_time = Some(now);
            return true;
        }
        false
    }
}

/// Snapshot returned by [`EmergencyStopManager::status_report`]
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStatusReport {
    pub emergency_active: bool,
    pub consecutive_losses: u32,
    pub consecutive_api_errors: u32,
    pub conditions: BTreeMap<String, EmergencyCondition>,
}

#[derive(Debug)]
struct StopState {
    active: bool,
    consecutive_losses: u32,
    consecutive_api_errors: u32,
    conditions: BTreeMap<String, EmergencyCondition>,
}

impl StopState {
    fn new(api_error_limit: u32, consecutive_losses_limit: u32) -> Self {
        let mut conditions = BTreeMap::new();
        conditions.insert(
            API_ERRORS.to_string(),
            EmergencyCondition::new("Repeated API errors", api_error_limit),
        );
        conditions.insert(
            CONSECUTIVE_LOSSES.to_string(),
            EmergencyCondition::new("Losing trade streak", consecutive_losses_limit),
        );

        Self {
            active: false,
            consecutive_losses: 0,
            consecutive_api_errors: 0,
            conditions,
        }
    }
}

/// Trading kill switch driven by API error and trade loss streaks.
///
/// Once any condition trips, trading stays blocked until an administrator
/// resets the manager with explicit confirmation.
#[derive(Debug)]
pub struct EmergencyStopManager {
    api_error_limit: u32,
    consecutive_losses_limit: u32,
    state: Mutex<StopState>,
}

impl EmergencyStopManager {
    pub fn new(api_error_limit: u32, consecutive_losses_limit: u32) -> Self {
        Self {
            api_error_limit,
            consecutive_losses_limit,
            state: Mutex::new(StopState::new(api_error_limit, consecutive_losses_limit)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of a closed trade
    pub fn report_trade_result(&self, profitable: bool) {
        let mut state = self.lock();
        if profitable {
            state.consecutive_losses = 0;
        } else {
            state.consecutive_losses += 1;
        }
        Self::check_locked(&mut state);
    }

    /// Re-evaluate every condition against the current counters
    pub fn check_conditions(&self) -> bool {
        let mut state = self.lock();
        Self::check_locked(&mut state)
    }

    fn check_locked(state: &mut StopState) -> bool {
        let now = Utc::now();
        let api_errors = state.consecutive_api_errors;
        let losses = state.consecutive_losses;

        if let Some(condition) = state.conditions.get_mut(API_ERRORS) {
            if condition.observe(api_errors, now) {
                tracing::error!("🚨 Repeated API errors: {} in a row", api_errors);
            }
        }
        if let Some(condition) = state.conditions.get_mut(CONSECUTIVE_LOSSES) {
            if condition.observe(losses, now) {
                tracing::error!("🚨 Losing trade streak: {} in a row", losses);
            }
        }

        let triggered = state.conditions.values().any(|c| c.triggered);
        if triggered && !state.active {
            state.active = true;
            let reasons = Self::triggered_names(state).join("; ");
            tracing::error!("🚨🚨🚨 EMERGENCY STOP - trading halted: {}", reasons);
        }

        state.active
    }

    fn triggered_names(state: &StopState) -> Vec<String> {
        state
            .conditions
            .values()
            .filter(|c| c.triggered)
            .map(|c| format!("{}: {}", c.name, c.current_value))
            .collect()
    }

    /// Whether trading may continue, with the triggered conditions if not
    pub fn is_trading_allowed(&self) -> (bool, String) {
        let state = self.lock();
        if state.active {
            let reasons = Self::triggered_names(&state).join("; ");
            return (false, format!("emergency stop active: {}", reasons));
        }
        (true, "trading allowed".to_string())
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Clear every condition and counter. Requires explicit confirmation.
    pub fn reset(&self, confirmed: bool) -> bool {
        if !confirmed {
            tracing::warn!("⚠️ Emergency stop reset attempted without confirmation");
            return false;
        }

        *self.lock() = StopState::new(self.api_error_limit, self.consecutive_losses_limit);
        tracing::warn!("🔄 Emergency stop reset by administrator");
        true
    }

    pub fn status_report(&self) -> EmergencyStatusReport {
        let state = self.lock();
        EmergencyStatusReport {
            emergency_active: state.active,
            consecutive_losses: state.consecutive_losses,
            consecutive_api_errors: state.consecutive_api_errors,
            conditions: state.conditions.clone(),
        }
    }
}

impl Default for EmergencyStopManager {
    fn default() -> Self {
        Self::new(10, 7)
    }
}

impl EmergencyStop for EmergencyStopManager {
    fn report_api_error(&self) -> Result<()> {
        let mut state = self.lock();
        state.consecutive_api_errors += 1;
        Self::check_locked(&mut state);
        Ok(())
    }

    fn report_api_success(&self) -> Result<()> {
        let mut state = self.lock();
        state.consecutive_api_errors = state.consecutive_api_errors.saturating_sub(1);
        Self::check_locked(&mut state);
        Ok(())
    }
}
