use async_trait::async_trait;

use crate::domain::BackendPosition;
use crate::error::Result;

/// Read side of the execution backend used by the telemetry monitor.
///
/// Implementations must return `GuardError::Transport` when the backend could
/// not be reached, and `Ok(vec![])` only when there really are no positions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn fetch_open_positions(&self) -> Result<Vec<BackendPosition>>;
}
