use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::circuit_breaker::{lock, CircuitBreaker};
use crate::error::BreakerError;

/// Running monitoring task and its shutdown signal
pub(crate) struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CircuitBreaker {
    /// Spawn the background monitoring task on the current tokio runtime.
    ///
    /// Returns `false` without spawning anything if monitoring is already
    /// running or no runtime is available.
    pub fn start_monitoring(self: &Arc<Self>) -> bool {
        let mut monitor = lock(&self.monitor);

        if let Some(handle) = monitor.as_ref() {
            if !handle.task.is_finished() {
                return false;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("Cannot start circuit breaker monitoring: {}", e);
                return false;
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(monitoring_loop(Arc::downgrade(self), shutdown_rx));
        *monitor = Some(MonitorHandle { shutdown, task });

        tracing::info!(
            interval_ms = self.config().monitor_interval_ms,
            "🔌 Circuit breaker monitoring started"
        );
        true
    }

    /// Signal the monitoring task to stop and wait for it to exit.
    ///
    /// Waits at most `stop_timeout`; a task that overruns is aborted.
    /// Calling this when monitoring is not running is a no-op.
    pub async fn stop_monitoring(&self) -> Result<(), BreakerError> {
        let Some(MonitorHandle { shutdown, mut task }) = lock(&self.monitor).take() else {
            return Ok(());
        };

        // The receiver is gone if the task already exited
        let _ = shutdown.send(true);

        let timeout = self.config().stop_timeout();
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {
                tracing::info!("⏹️ Circuit breaker monitoring stopped");
                Ok(())
            }
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                task.abort();
                tracing::warn!(
                    "Circuit breaker monitoring did not stop within {:?}, aborted",
                    timeout
                );
                Err(BreakerError::MonitorStopTimeout(timeout))
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor)
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }
}

async fn monitoring_loop(breaker: Weak<CircuitBreaker>, mut shutdown: watch::Receiver<bool>) {
    loop {
        // Exit once the breaker itself is gone
        let Some(current) = breaker.upgrade() else {
            break;
        };

        let pause = match run_tick(&current) {
            Ok(()) => current.config().monitor_interval(),
            Err(message) => {
                tracing::error!("❌ Circuit breaker monitoring tick failed: {}", message);
                current.config().monitor_backoff()
            }
        };
        drop(current);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Circuit breaker monitoring loop exited");
}

/// Run one tick, turning a panic into an error message
fn run_tick(breaker: &CircuitBreaker) -> Result<(), String> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        breaker.monitor_tick();
    }))
    .map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::clock::{Clock, ManualClock};
    use crate::breaker::CircuitState;
    use crate::config::BreakerConfig;
    use crate::emergency::NoopEmergencyStop;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            monitor_interval_ms: 10,
            monitor_backoff_ms: 10,
            stop_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn breaker(clock: Arc<dyn Clock>) -> Arc<CircuitBreaker> {
        Arc::new(
            CircuitBreaker::with_clock(fast_config(), Arc::new(NoopEmergencyStop), clock).unwrap(),
        )
    }

    /// Clock that panics while `armed` is set
    struct FaultyClock {
        inner: ManualClock,
        armed: AtomicBool,
    }

    impl Clock for FaultyClock {
        fn now(&self) -> DateTime<Utc> {
            if self.armed.load(Ordering::SeqCst) {
                panic!("clock unavailable");
            }
            self.inner.now()
        }
    }

    async fn wait_for_state(breaker: &CircuitBreaker, state: CircuitState) -> bool {
        for _ in 0..100 {
            if breaker.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins() {
        let breaker = breaker(Arc::new(ManualClock::new()));

        assert!(breaker.start_monitoring());
        assert!(!breaker.start_monitoring());
        assert!(breaker.is_monitoring());

        tokio_test::assert_ok!(breaker.stop_monitoring().await);
        assert!(!breaker.is_monitoring());

        // Stopping twice is harmless
        tokio_test::assert_ok!(breaker.stop_monitoring().await);
    }

    #[tokio::test]
    async fn test_loop_moves_open_to_half_open() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure("HTTP_500");
        }
        breaker.start_monitoring();

        clock.advance_secs(300);

        assert!(wait_for_state(&breaker, CircuitState::HalfOpen).await);
        breaker.stop_monitoring().await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_refreshes_rates() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        breaker.record_failure("HTTP_500");
        breaker.record_failure("HTTP_500");
        breaker.start_monitoring();

        let mut refreshed = false;
        for _ in 0..100 {
            if breaker.get_status().error_rate_1min == 2.0 {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        breaker.stop_monitoring().await.unwrap();
        assert!(refreshed);
    }

    #[tokio::test]
    async fn test_failed_tick_retries_after_backoff_not_interval() {
        let clock = Arc::new(FaultyClock {
            inner: ManualClock::new(),
            armed: AtomicBool::new(false),
        });
        // A regular tick would not come round again within the test
        let breaker = Arc::new(
            CircuitBreaker::with_clock(
                BreakerConfig {
                    monitor_interval_ms: 10_000,
                    monitor_backoff_ms: 10,
                    stop_timeout_ms: 1_000,
                    ..Default::default()
                },
                Arc::new(NoopEmergencyStop),
                clock.clone(),
            )
            .unwrap(),
        );
        breaker.force_open("manual");

        clock.armed.store(true, Ordering::SeqCst);
        breaker.start_monitoring();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(breaker.is_monitoring());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.armed.store(false, Ordering::SeqCst);
        clock.inner.advance_secs(300);

        let started = std::time::Instant::now();
        assert!(wait_for_state(&breaker, CircuitState::HalfOpen).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        breaker.stop_monitoring().await.unwrap();
    }

    #[test]
    fn test_start_without_runtime_is_refused() {
        let breaker = breaker(Arc::new(ManualClock::new()));
        assert!(!breaker.start_monitoring());
        assert!(!breaker.is_monitoring());
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
