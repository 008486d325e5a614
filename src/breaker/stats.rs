use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Rolling API error statistics.
///
/// Counters are updated on every recorded outcome; the windowed rates are
/// only recomputed by [`ErrorStats::refresh`], which the monitoring tick calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub last_error_time: Option<DateTime<Utc>>,
    /// Failure timestamps, oldest first
    pub recent_errors: VecDeque<DateTime<Utc>>,
    /// Failures in the last minute
    pub error_rate_1min: f64,
    /// Average failures per minute over the last five minutes
    pub error_rate_5min: f64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed call. Returns the updated consecutive error count.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> u32 {
        self.total_errors += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.consecutive_successes = 0;
        self.last_error_time = Some(now);
        self.recent_errors.push_back(now);
        self.consecutive_errors
    }

    /// Record a successful call. Returns the updated consecutive success count.
    pub fn record_success(&mut self) -> u32 {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_errors = 0;
        self.consecutive_successes
    }

    /// Drop failures older than `window`. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        let before = self.recent_errors.len();

        // Timestamps arrive in order, but a clock step backwards can break that
        self.recent_errors.retain(|t| *t > cutoff);

        before - self.recent_errors.len()
    }

    /// Recompute the 1 and 5 minute error rates from the recent error log
    pub fn update_rates(&mut self, now: DateTime<Utc>) {
        let one_min_ago = now - Duration::minutes(1);
        let five_min_ago = now - Duration::minutes(5);

        let errors_1min = self.errors_since(one_min_ago);
        let errors_5min = self.errors_since(five_min_ago);

        self.error_rate_1min = errors_1min as f64;
        self.error_rate_5min = errors_5min as f64 / 5.0;
    }

    /// Prune and recompute rates in one step
    pub fn refresh(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let pruned = self.prune(now, window);
        self.update_rates(now);
        pruned
    }

    fn errors_since(&self, since: DateTime<Utc>) -> usize {
        self.recent_errors.iter().filter(|t| **t > since).count()
    }
}
