use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::BreakerError;

const ENV_PREFIX: &str = "TRADEGUARD";
const DEFAULT_CONFIG_FILE: &str = "tradeguard";
const MAX_ERROR_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Breaker thresholds and monitoring timings.
///
/// Loaded once at start-up and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker
    pub failure_threshold: u32,
    /// Consecutive successes in trial mode needed to close again
    pub success_threshold: u32,
    /// Time an open breaker waits before allowing trial traffic
    pub recovery_timeout_secs: u64,
    /// Trailing window kept in the recent error log
    pub error_window_secs: u64,
    /// Monitoring tick period
    pub monitor_interval_ms: u64,
    /// Pause after a failed monitoring tick
    pub monitor_backoff_ms: u64,
    /// How long `stop_monitoring` waits for the task to exit
    pub stop_timeout_ms: u64,
    /// 1-minute error rate above which a closed breaker reports unhealthy
    pub elevated_error_rate: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_secs: 300, // 5 minutes
            error_window_secs: 300,
            monitor_interval_ms: 10_000,
            monitor_backoff_ms: 5_000,
            stop_timeout_ms: 5_000,
            elevated_error_rate: 3.0,
        }
    }
}

impl BreakerConfig {
    /// Load configuration from `tradeguard.toml` (optional) and `TRADEGUARD_*` env vars
    pub fn load() -> Result<Self, BreakerError> {
        dotenvy::dotenv().ok();
        Self::from_sources(File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Load configuration from an explicit file, still allowing env overrides
    pub fn load_from(path: &Path) -> Result<Self, BreakerError> {
        dotenvy::dotenv().ok();
        Self::from_sources(File::from(path).required(true))
    }

    fn from_sources(
        file: File<config::FileSourceFile, config::FileFormat>,
    ) -> Result<Self, BreakerError> {
        let config: Self = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        tracing::debug!(?config, "Loaded breaker configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BreakerError> {
        if self.failure_threshold == 0 {
            return Err(BreakerError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(BreakerError::InvalidConfig(
                "success_threshold must be at least 1".to_string(),
            ));
        }
        if self.monitor_interval_ms == 0 || self.monitor_backoff_ms == 0 {
            return Err(BreakerError::InvalidConfig(
                "monitoring intervals must be non-zero".to_string(),
            ));
        }
        if self.error_window_secs < 60 {
            return Err(BreakerError::InvalidConfig(
                "error_window_secs must cover at least one minute".to_string(),
            ));
        }
        if self.error_window_secs > MAX_ERROR_WINDOW_SECS {
            return Err(BreakerError::InvalidConfig(format!(
                "error_window_secs must not exceed {} (one day)",
                MAX_ERROR_WINDOW_SECS
            )));
        }
        Ok(())
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn monitor_backoff(&self) -> Duration {
        Duration::from_millis(self.monitor_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
