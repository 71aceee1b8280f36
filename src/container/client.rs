//! Docker/Podman client wrapper.
//!
//! Handles connecting to the container engine with fallback strategies and
//! exposes the low-level bollard handle to the driver.

use crate::container::{ContainerError, Result};
use bollard::Docker;
use std::sync::Arc;
use tracing::{debug, info};

/// Docker/Podman API client wrapper.
#[derive(Clone)]
pub struct ContainerClient {
    docker: Arc<Docker>,
}

impl ContainerClient {
    /// Connect to the container engine and verify it answers.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::EngineUnavailable`] if neither Docker nor
    /// Podman can be reached.
    pub async fn connect() -> Result<Self> {
        let docker = Self::try_connect().await?;

        let client = Self {
            docker: Arc::new(docker),
        };
        client.ping().await?;

        Ok(client)
    }

    /// Connection strategies, in order:
    /// 1. Local defaults (Unix socket or Windows named pipe)
    /// 2. Rootless Podman socket
    /// 3. System Podman socket
    async fn try_connect() -> Result<Docker> {
        debug!("Attempting to connect to container runtime...");

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            if let Ok(home) = std::env::var("HOME") {
                let podman_socket = format!("unix://{}/run/podman/podman.sock", home);
                debug!("Trying Podman socket: {}", podman_socket);

                match Docker::connect_with_socket(&podman_socket, 120, bollard::API_DEFAULT_VERSION)
                {
                    Ok(docker) => {
                        info!("Connected to Podman via rootless socket");
                        return Ok(docker);
                    }
                    Err(e) => {
                        debug!("Podman rootless socket failed: {}", e);
                    }
                }
            }

            let system_socket = "unix:///run/podman/podman.sock";
            debug!("Trying system Podman socket: {}", system_socket);

            match Docker::connect_with_socket(system_socket, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => {
                    info!("Connected to Podman via system socket");
                    return Ok(docker);
                }
                Err(e) => {
                    debug!("Podman system socket failed: {}", e);
                }
            }
        }

        Err(ContainerError::EngineUnavailable(
            "failed to connect to Docker or Podman; is the daemon running?".to_string(),
        ))
    }

    /// Ping the container runtime to verify connectivity.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| ContainerError::EngineUnavailable(e.to_string()))?;
        debug!("Container runtime ping successful");
        Ok(())
    }

    /// Check if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ContainerError::Api(e)),
        }
    }

    /// Get a container ID by name.
    pub async fn container_id(&self, name: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(
                name,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => ContainerError::NotFound(name.to_string()),
                e => ContainerError::Api(e),
            })?;

        inspect
            .id
            .ok_or_else(|| ContainerError::Other(format!("container {} has no ID", name)))
    }

    /// Check whether a container exists by name or id.
    pub async fn container_exists(&self, name_or_id: &str) -> Result<bool> {
        match self.container_id(name_or_id).await {
            Ok(_) => Ok(true),
            Err(ContainerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Direct access to the bollard handle for driver operations.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker/Podman to be running
    async fn test_client_connection() {
        let client = ContainerClient::connect().await.unwrap();
        client.ping().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_missing_container_reports_not_found() {
        let client = ContainerClient::connect().await.unwrap();
        let err = client
            .container_id("cellbox-definitely-not-a-container")
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(_)));
    }
}
