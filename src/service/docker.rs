//! Docker runtime using bollard.
//!
//! This module owns the Docker connection and implements
//! [`ContainerRuntime`] on top of the bollard API.

use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{
    InspectContainerOptions, InspectContainerOptionsBuilder, RestartContainerOptions,
    RestartContainerOptionsBuilder,
};

use crate::service::lifecycle::{ContainerRuntime, LifecycleError};
use crate::service::snapshot::ContainerSnapshot;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the default connection method
    /// (Unix socket on Linux/macOS, named pipe on Windows).
    ///
    /// bollard connects lazily, so this only fails on a malformed
    /// `DOCKER_HOST`. Use [`DockerRuntime::ping`] to check the daemon.
    pub fn connect() -> Result<Self, LifecycleError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), LifecycleError> {
        self.docker.ping().await?;
        Ok(())
    }
}

fn map_error(container: &str, e: bollard::errors::Error) -> LifecycleError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => LifecycleError::NotFound(container.to_string()),
        e => LifecycleError::Runtime(e),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, LifecycleError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        let info = self
            .docker
            .inspect_container(name, Some(options))
            .await
            .map_err(|e| map_error(name, e))?;

        Ok(ContainerSnapshot::from_inspect(name, info))
    }

    async fn restart(&self, name: &str, stop_timeout: Duration) -> Result<(), LifecycleError> {
        log::info!("Restarting container {name} (stop timeout {stop_timeout:?})");

        let stop_secs = i32::try_from(stop_timeout.as_secs()).unwrap_or(i32::MAX);
        let options: RestartContainerOptions =
            RestartContainerOptionsBuilder::new().t(stop_secs).build();

        self.docker
            .restart_container(name, Some(options))
            .await
            .map_err(|e| map_error(name, e))
            .inspect_err(|e| log::error!("Failed to restart container {name}: {e}"))?;

        log::info!("Container {name} restarted");
        Ok(())
    }
}
