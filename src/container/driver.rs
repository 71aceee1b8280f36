//! Worker container lifecycle driver.
//!
//! Owns every engine-side operation the controller needs: ensuring the
//! bridge network, creating containers under the hardening contract,
//! starting them, resolving their address, waiting for the worker HTTP
//! server to report healthy, and tearing containers down again. Stop and
//! remove absorb NotFound so release paths stay idempotent.

use crate::config::SandboxConfig;
use crate::container::{ContainerClient, ContainerError, Result, WorkerContainerSpec};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A caller-supplied volume mount: host path keyed map value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeBinding {
    /// Target path inside the container
    pub bind: String,
    /// Mount mode, "rw" or "ro"
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "rw".to_string()
}

/// Flattened view of one engine-side container.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
}

/// High-level driver for worker containers.
pub struct ContainerDriver {
    client: ContainerClient,
    config: SandboxConfig,
    http: reqwest::Client,
    /// Cached network id once ensured.
    network_id: RwLock<Option<String>>,
}

impl ContainerDriver {
    pub fn new(client: ContainerClient, config: SandboxConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            client,
            config,
            http,
            network_id: RwLock::new(None),
        }
    }

    /// Ping the container engine.
    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    /// Ensure the worker bridge network exists, returning its id.
    pub async fn ensure_network(&self) -> Result<String> {
        if let Some(id) = self.network_id.read().await.clone() {
            return Ok(id);
        }

        let network_name = &self.config.network_name;

        let existing = self
            .client
            .docker()
            .inspect_network(
                network_name,
                None::<bollard::network::InspectNetworkOptions<String>>,
            )
            .await;

        let id = match existing {
            Ok(network) => {
                debug!("Using existing network: {}", network_name);
                network.id.unwrap_or_else(|| network_name.clone())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let response = self
                    .client
                    .docker()
                    .create_network(bollard::network::CreateNetworkOptions {
                        name: network_name.as_str(),
                        driver: "bridge",
                        ..Default::default()
                    })
                    .await?;
                info!("Created network: {} ({})", network_name, response.id);
                response.id
            }
            Err(e) => return Err(ContainerError::Api(e)),
        };

        *self.network_id.write().await = Some(id.clone());
        Ok(id)
    }

    /// Pull the worker image if it is not present locally.
    pub async fn ensure_image(&self) -> Result<()> {
        let image = &self.config.worker_image;
        if self.client.image_exists(image).await? {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }

        info!("Pulling image: {}", image);
        let mut stream = self.client.docker().create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image.as_str(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => return Err(ContainerError::Api(e)),
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Create a worker container (not started).
    ///
    /// Applies the full contract: configured image and network, memory cap,
    /// CPU quota, pid limit, dropped capabilities, `no-new-privileges`.
    /// Caller volumes and environment are passed through as provided.
    pub async fn create(
        &self,
        name: &str,
        volumes: Option<&HashMap<String, VolumeBinding>>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        self.ensure_network().await?;
        self.ensure_image().await?;

        let mut builder = WorkerContainerSpec::builder()
            .image(&self.config.worker_image)
            .network(&self.config.network_name)
            .memory_limit(self.config.memory_limit_bytes())
            .cpu_quota(self.config.cpu_quota_us())
            .label("cellbox.managed", "true");

        if let Some(volumes) = volumes {
            for (host_path, binding) in volumes {
                builder = builder.bind(format!("{}:{}:{}", host_path, binding.bind, binding.mode));
            }
        }

        if let Some(env) = env {
            builder = builder.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let spec = builder.build()?;

        let options = bollard::container::CreateContainerOptions {
            name,
            ..Default::default()
        };

        debug!("Creating container: {}", name);

        let bollard_config = bollard::container::Config {
            image: Some(spec.image),
            env: spec.env,
            labels: spec.labels,
            host_config: Some(spec.host_config),
            ..Default::default()
        };

        let response = self
            .client
            .docker()
            .create_container(Some(options), bollard_config)
            .await?;

        info!(
            "Created container: {} ({})",
            name,
            response.id.get(..12).unwrap_or(&response.id)
        );

        Ok(response.id)
    }

    /// Start a container.
    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.client
            .docker()
            .start_container(
                container_id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        info!(
            "Started container: {}",
            container_id.get(..12).unwrap_or(container_id)
        );
        Ok(())
    }

    /// Resolve a running container's address, preferring the configured
    /// network and falling back to any attached one.
    pub async fn container_ip(&self, container_id: &str) -> Result<String> {
        let inspect = self
            .client
            .docker()
            .inspect_container(
                container_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => ContainerError::NotFound(container_id.to_string()),
                e => ContainerError::Api(e),
            })?;

        let networks = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        if let Some(endpoint) = networks.get(&self.config.network_name) {
            if let Some(ip) = endpoint.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
                return Ok(ip.to_string());
            }
        }

        for endpoint in networks.values() {
            if let Some(ip) = endpoint.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
                return Ok(ip.to_string());
            }
        }

        Err(ContainerError::Other(format!(
            "failed to get IP for container {}",
            container_id.get(..12).unwrap_or(container_id)
        )))
    }

    /// Poll the worker's `/health` endpoint until it answers 200 or the
    /// configured timeout elapses. Cancel-safe: dropping the future stops
    /// the polling.
    pub async fn wait_healthy(&self, container_ip: &str, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.config.health_check_timeout());
        let interval = self.config.health_check_interval();
        let health_url = format!(
            "http://{}:{}/health",
            container_ip, self.config.worker_port
        );

        let start = Instant::now();
        let mut last_error: Option<String> = None;

        while start.elapsed() < timeout {
            match self.http.get(&health_url).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        "Worker at {} is healthy ({:.1}s)",
                        container_ip,
                        start.elapsed().as_secs_f64()
                    );
                    return Ok(());
                }
                Ok(response) => {
                    last_error = Some(format!("status {}", response.status()));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            tokio::time::sleep(interval).await;
        }

        warn!(
            "Worker at {} health check timed out after {}s: {}",
            container_ip,
            timeout.as_secs(),
            last_error.unwrap_or_else(|| "no response".to_string())
        );
        Err(ContainerError::HealthTimeout(timeout.as_secs()))
    }

    /// Stop a container, absorbing NotFound.
    pub async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        let result = self
            .client
            .docker()
            .stop_container(
                container_id,
                Some(bollard::container::StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await;

        match result {
            Ok(()) => {
                info!(
                    "Stopped container: {}",
                    container_id.get(..12).unwrap_or(container_id)
                );
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                warn!("Error stopping container {}: {}", container_id, e);
                Err(ContainerError::Api(e))
            }
        }
    }

    /// Force-remove a container and its anonymous volumes, absorbing NotFound.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        let result = self
            .client
            .docker()
            .remove_container(
                container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => {
                info!(
                    "Removed container: {}",
                    container_id.get(..12).unwrap_or(container_id)
                );
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                warn!("Error removing container {}: {}", container_id, e);
                Err(ContainerError::Api(e))
            }
        }
    }

    /// Look a container up by id.
    pub async fn get(&self, container_id: &str) -> Result<Option<ContainerSummary>> {
        let inspect = self
            .client
            .docker()
            .inspect_container(
                container_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await;

        match inspect {
            Ok(details) => Ok(Some(ContainerSummary {
                id: details.id.unwrap_or_else(|| container_id.to_string()),
                name: details
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: details
                    .config
                    .and_then(|c| c.image)
                    .unwrap_or_default(),
                state: details
                    .state
                    .and_then(|s| s.status)
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            })),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(ContainerError::Api(e)),
        }
    }

    /// List containers (running or not) whose name starts with the
    /// configured prefix.
    pub async fn list_by_prefix(&self) -> Result<Vec<ContainerSummary>> {
        let prefix = &self.config.container_prefix;

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.clone()]);

        let containers = self
            .client
            .docker()
            .list_containers(Some(bollard::container::ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())?;
                // The engine's name filter is a substring match; enforce the
                // prefix here.
                if !name.starts_with(prefix.as_str()) {
                    return None;
                }
                Some(ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name,
                    image: c.image.unwrap_or_default(),
                    state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                })
            })
            .collect())
    }

    /// Stop and remove a set of containers, or every prefix-matched worker
    /// container when `container_ids` is None. Returns how many were
    /// cleaned.
    pub async fn cleanup_containers(&self, container_ids: Option<&[String]>) -> Result<usize> {
        let targets: Vec<String> = match container_ids {
            Some(ids) => ids.to_vec(),
            None => self
                .list_by_prefix()
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect(),
        };

        let mut count = 0;
        for id in &targets {
            let _ = self.stop(id, Duration::from_secs(10)).await;
            if self.remove(id).await.is_ok() {
                count += 1;
            }
        }

        if count > 0 {
            info!("Cleaned up {} containers", count);
        }
        Ok(count)
    }

    /// The loaded configuration this driver runs under.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_binding_default_mode_is_rw() {
        let binding: VolumeBinding = serde_json::from_str(r#"{"bind": "/data"}"#).unwrap();
        assert_eq!(binding.bind, "/data");
        assert_eq!(binding.mode, "rw");
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_network_ensure_is_idempotent() {
        let client = ContainerClient::connect().await.unwrap();
        let driver = ContainerDriver::new(client, SandboxConfig::default());

        let first = driver.ensure_network().await.unwrap();
        let second = driver.ensure_network().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    #[ignore]
    async fn test_stop_and_remove_absorb_not_found() {
        let client = ContainerClient::connect().await.unwrap();
        let driver = ContainerDriver::new(client, SandboxConfig::default());

        driver
            .stop("cellbox-no-such-container", Duration::from_secs(1))
            .await
            .unwrap();
        driver.remove("cellbox-no-such-container").await.unwrap();
    }
}
