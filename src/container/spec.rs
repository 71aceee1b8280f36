//! Worker container specification builder.
//!
//! Builds the bollard configuration for a worker container, enforcing the
//! hardening contract: memory and CPU caps, a pid limit, all capabilities
//! dropped, and `no-new-privileges`.

use crate::container::{ContainerError, Result};
use bollard::service::HostConfig;
use std::collections::HashMap;

/// Pid cap applied to every worker container.
const WORKER_PIDS_LIMIT: i64 = 100;

/// Specification for one worker container.
#[derive(Debug, Clone)]
pub struct WorkerContainerSpec {
    /// Image name
    pub image: String,
    /// Environment variables, `KEY=value` form
    pub env: Option<Vec<String>>,
    /// Labels
    pub labels: Option<HashMap<String, String>>,
    /// Host configuration (limits, binds, network, security options)
    pub host_config: HostConfig,
}

impl WorkerContainerSpec {
    /// Create a new specification builder.
    pub fn builder() -> WorkerContainerSpecBuilder {
        WorkerContainerSpecBuilder::new()
    }
}

/// Fluent builder for [`WorkerContainerSpec`].
pub struct WorkerContainerSpecBuilder {
    image: Option<String>,
    env: Vec<String>,
    labels: HashMap<String, String>,
    memory_limit: Option<i64>,
    cpu_quota: Option<i64>,
    binds: Vec<String>,
    network: Option<String>,
}

impl Default for WorkerContainerSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerContainerSpecBuilder {
    pub fn new() -> Self {
        Self {
            image: None,
            env: Vec::new(),
            labels: HashMap::new(),
            memory_limit: None,
            cpu_quota: None,
            binds: Vec::new(),
            network: None,
        }
    }

    /// Set the worker image.
    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in envs {
            self.env.push(format!("{}={}", k.into(), v.into()));
        }
        self
    }

    /// Add a label.
    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the memory cap in bytes.
    pub fn memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set the CPU quota in microseconds per period.
    pub fn cpu_quota(mut self, quota: i64) -> Self {
        self.cpu_quota = Some(quota);
        self
    }

    /// Add a volume bind (`host_path:container_path[:mode]`).
    pub fn bind<S: Into<String>>(mut self, bind: S) -> Self {
        self.binds.push(bind.into());
        self
    }

    /// Attach to a named bridge network.
    pub fn network<S: Into<String>>(mut self, network: S) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Build the specification.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::Spec`] if the image is missing.
    pub fn build(self) -> Result<WorkerContainerSpec> {
        let image = self
            .image
            .ok_or_else(|| ContainerError::Spec("image is required".to_string()))?;

        let host_config = HostConfig {
            binds: if self.binds.is_empty() {
                None
            } else {
                Some(self.binds)
            },
            memory: self.memory_limit,
            cpu_quota: self.cpu_quota,
            network_mode: self.network,
            pids_limit: Some(WORKER_PIDS_LIMIT),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        Ok(WorkerContainerSpec {
            image,
            env: if self.env.is_empty() {
                None
            } else {
                Some(self.env)
            },
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels)
            },
            host_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_spec() {
        let spec = WorkerContainerSpec::builder()
            .image("cellbox/worker:latest")
            .network("cellbox-network")
            .build()
            .unwrap();

        assert_eq!(spec.image, "cellbox/worker:latest");
        assert_eq!(
            spec.host_config.network_mode.as_deref(),
            Some("cellbox-network")
        );
    }

    #[test]
    fn test_hardening_always_applied() {
        let spec = WorkerContainerSpec::builder()
            .image("cellbox/worker:latest")
            .build()
            .unwrap();

        assert_eq!(spec.host_config.pids_limit, Some(100));
        assert_eq!(spec.host_config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            spec.host_config.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
    }

    #[test]
    fn test_resource_limits() {
        let spec = WorkerContainerSpec::builder()
            .image("cellbox/worker:latest")
            .memory_limit(2_147_483_648)
            .cpu_quota(100_000)
            .build()
            .unwrap();

        assert_eq!(spec.host_config.memory, Some(2_147_483_648));
        assert_eq!(spec.host_config.cpu_quota, Some(100_000));
    }

    #[test]
    fn test_env_and_binds() {
        let spec = WorkerContainerSpec::builder()
            .image("cellbox/worker:latest")
            .env("CELLBOX_WORKER_PORT", "9000")
            .bind("/host/data:/data:rw")
            .build()
            .unwrap();

        assert!(spec
            .env
            .unwrap()
            .contains(&"CELLBOX_WORKER_PORT=9000".to_string()));
        assert_eq!(
            spec.host_config.binds.unwrap(),
            vec!["/host/data:/data:rw".to_string()]
        );
    }

    #[test]
    fn test_missing_image_error() {
        let result = WorkerContainerSpec::builder().build();
        assert!(matches!(result, Err(ContainerError::Spec(_))));
    }
}
