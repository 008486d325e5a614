// Emergency stop collaborator
pub mod stop_manager;

pub use stop_manager::{EmergencyCondition, EmergencyStatusReport, EmergencyStopManager};

use crate::Result;

/// Receiver of fire-and-forget API health notifications.
///
/// The breaker calls `report_api_error` when it trips into Open, and the
/// request gate calls `report_api_success` after every successful call.
/// Errors and panics raised here are caught and logged by the caller.
pub trait EmergencyStop: Send + Sync {
    fn report_api_error(&self) -> Result<()>;
    fn report_api_success(&self) -> Result<()>;
}

/// Collaborator that ignores every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmergencyStop;

impl EmergencyStop for NoopEmergencyStop {
    fn report_api_error(&self) -> Result<()> {
        Ok(())
    }

    fn report_api_success(&self) -> Result<()> {
        Ok(())
    }
}
