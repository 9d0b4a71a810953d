use async_trait::async_trait;

use crate::errors::SessionError;
use crate::worker::WorkerUnit;

/// Cluster lifecycle collaborator. Failures surface as [`SessionError::Provisioning`].
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Units already running, used to seed the pool at startup.
    async fn list_running(&self) -> Result<Vec<WorkerUnit>, SessionError>;

    /// Start `n` new units and wait until each reports running.
    async fn create(&self, n: usize) -> Result<Vec<WorkerUnit>, SessionError>;

    async fn terminate(&self, unit: &WorkerUnit) -> Result<(), SessionError>;
}
