use std::time::Duration;

use async_trait::async_trait;

use crate::service::snapshot::ContainerSnapshot;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Docker API error: {0}")]
    Runtime(#[from] bollard::errors::Error),
}

/// Inspect and restart operations against the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, LifecycleError>;

    /// Stop the container (killing it after `stop_timeout`) and start it again.
    ///
    /// Returns once the runtime reports the container started. The workload
    /// inside may still be booting.
    async fn restart(&self, name: &str, stop_timeout: Duration) -> Result<(), LifecycleError>;
}
