// Call-site integration for the circuit breaker

use std::future::Future;
use std::sync::Arc;

use super::circuit_breaker::CircuitBreaker;
use crate::error::CircuitOpenError;

/// Runs operations through the breaker: admission check, call, outcome report.
///
/// The operation's own error type is returned untouched. A rejected call is
/// turned into that same type through `From<CircuitOpenError>`, so
/// `anyhow::Error` and boxed errors work out of the box.
#[derive(Clone)]
pub struct RequestGate {
    breaker: Arc<CircuitBreaker>,
}

impl RequestGate {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run an async operation, labelling failures with the error's type name
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.call_classified(operation, |_| error_label::<E>())
            .await
    }

    /// Run an async operation, labelling failures with a fixed kind
    pub async fn call_with_kind<T, E, F, Fut>(&self, kind: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.call_classified(operation, |_| kind.to_string())
            .await
    }

    /// Run an async operation, labelling failures by inspecting the error
    pub async fn call_classified<T, E, F, Fut, C>(&self, operation: F, classify: C) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
        C: FnOnce(&E) -> String,
    {
        self.admit()?;
        let outcome = operation().await;
        self.observe(outcome, classify)
    }

    /// Blocking counterpart of [`RequestGate::call_classified`]
    pub fn execute<T, E, F, C>(&self, operation: F, classify: C) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<CircuitOpenError>,
        C: FnOnce(&E) -> String,
    {
        self.admit()?;
        let outcome = operation();
        self.observe(outcome, classify)
    }

    /// Fail fast if the breaker denies admission
    fn admit(&self) -> Result<(), CircuitOpenError> {
        let (allowed, reason) = self.breaker.can_execute_request();
        if allowed {
            return Ok(());
        }

        tracing::warn!("🚫 Request blocked by circuit breaker: {}", reason);
        Err(CircuitOpenError::new(reason))
    }

    fn observe<T, E, C>(&self, outcome: Result<T, E>, classify: C) -> Result<T, E>
    where
        C: FnOnce(&E) -> String,
    {
        match outcome {
            Ok(value) => {
                self.breaker.record_success();
                self.breaker.notify_success();
                Ok(value)
            }
            Err(e) => {
                let kind = classify(&e);
                self.breaker.record_failure(&kind);
                Err(e)
            }
        }
    }
}

/// Short type name of an error type, e.g. `ExchangeError` or `Box`
fn error_label<E>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::clock::ManualClock;
    use crate::breaker::CircuitState;
    use crate::config::BreakerConfig;
    use crate::emergency::{EmergencyStop, NoopEmergencyStop};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    enum FakeApiError {
        #[error("exchange returned {0}")]
        Status(u16),
        #[error("rejected: {0}")]
        Rejected(String),
    }

    impl From<CircuitOpenError> for FakeApiError {
        fn from(e: CircuitOpenError) -> Self {
            FakeApiError::Rejected(e.reason)
        }
    }

    #[derive(Default)]
    struct SuccessCounter(AtomicUsize);

    impl EmergencyStop for SuccessCounter {
        fn report_api_error(&self) -> crate::Result<()> {
            Ok(())
        }

        fn report_api_success(&self) -> crate::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn gate() -> RequestGate {
        let breaker =
            CircuitBreaker::new(BreakerConfig::default(), Arc::new(NoopEmergencyStop)).unwrap();
        RequestGate::new(Arc::new(breaker))
    }

    #[tokio::test]
    async fn test_success_passes_value_through() {
        let gate = gate();
        let value: Result<u32, FakeApiError> = gate.call(|| async { Ok(42) }).await;

        assert_eq!(value, Ok(42));
        assert_eq!(gate.breaker().get_status().consecutive_successes, 1);
    }

    #[tokio::test]
    async fn test_failure_is_returned_unchanged_and_recorded() {
        let gate = gate();
        let result: Result<(), FakeApiError> =
            gate.call(|| async { Err(FakeApiError::Status(502)) }).await;

        assert_eq!(result, Err(FakeApiError::Status(502)));
        let status = gate.breaker().get_status();
        assert_eq!(status.total_errors, 1);
        assert_eq!(status.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_calling() {
        let gate = gate();
        gate.breaker().force_open("manual");

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), FakeApiError> = gate
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            result,
            Err(FakeApiError::Rejected(
                "circuit open: 0 consecutive errors".to_string()
            ))
        );
        // A rejection is not an API failure
        assert_eq!(gate.breaker().get_status().total_errors, 0);
    }

    #[tokio::test]
    async fn test_anyhow_callers_see_circuit_open_error() {
        let gate = gate();
        for _ in 0..5 {
            let _: anyhow::Result<()> = gate
                .call_with_kind("HTTP_500", || async {
                    Err::<(), _>(anyhow::anyhow!("server error"))
                })
                .await;
        }

        let err = gate
            .call(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap_err();

        let open = err.downcast_ref::<CircuitOpenError>().unwrap();
        assert!(open.reason.contains('5'));
    }

    #[tokio::test]
    async fn test_success_notifies_emergency_stop() {
        let stop = Arc::new(SuccessCounter::default());
        let breaker = CircuitBreaker::new(BreakerConfig::default(), stop.clone()).unwrap();
        let gate = RequestGate::new(Arc::new(breaker));

        for _ in 0..3 {
            let _: Result<(), FakeApiError> = gate.call(|| async { Ok(()) }).await;
        }
        let _: Result<(), FakeApiError> =
            gate.call(|| async { Err(FakeApiError::Status(500)) }).await;

        assert_eq!(stop.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_trial_mode_admits_concurrent_callers() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::with_clock(
            BreakerConfig {
                success_threshold: 100,
                ..Default::default()
            },
            Arc::new(NoopEmergencyStop),
            clock.clone(),
        )
        .unwrap();
        let gate = RequestGate::new(Arc::new(breaker));
        gate.breaker().force_open("manual");
        clock.advance_secs(300);
        gate.breaker().monitor_tick();

        let calls: Vec<_> = (0..10)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.call(|| async {
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        Ok::<_, FakeApiError>(())
                    })
                    .await
                })
            })
            .collect();

        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
        assert_eq!(gate.breaker().state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_blocking_execute_with_classifier() {
        let gate = gate();
        let result: Result<(), FakeApiError> =
            gate.execute(|| Err(FakeApiError::Status(429)), |e| match e {
                FakeApiError::Status(code) => format!("HTTP_{}", code),
                FakeApiError::Rejected(_) => "REJECTED".to_string(),
            });

        assert!(result.is_err());
        assert_eq!(gate.breaker().get_status().consecutive_errors, 1);
    }

    #[test]
    fn test_error_label_uses_short_type_name() {
        assert_eq!(error_label::<FakeApiError>(), "FakeApiError");
        assert_eq!(error_label::<std::io::Error>(), "Error");
        assert_eq!(
            error_label::<Box<dyn std::error::Error + Send + Sync>>(),
            "Box"
        );
    }
}
