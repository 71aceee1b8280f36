//! Container engine layer.
//!
//! Thin wrapper over Docker/Podman via the bollard API, split into:
//!
//! - [`client`]: daemon connection handling with fallback strategies
//! - [`driver`]: worker-container lifecycle (network, create, start, health
//!   wait, stop, remove, prefix listing)
//! - [`spec`]: worker container specification builder
//!
//! The driver owns the creation contract for worker containers: detached,
//! attached to the configured bridge network, memory and CPU capped, pid
//! limited, all capabilities dropped, `no-new-privileges` set.

mod client;
mod driver;
mod spec;

pub use client::ContainerClient;
pub use driver::{ContainerDriver, ContainerSummary, VolumeBinding};
pub use spec::{WorkerContainerSpec, WorkerContainerSpecBuilder};

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker/Podman API error
    #[error("container API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// Container not found
    #[error("container not found: {0}")]
    NotFound(String),

    /// No container engine answered
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Container was created but could not start
    #[error("container failed to start: {0}")]
    StartFailed(String),

    /// Worker never reported healthy within the window
    #[error("worker health check timed out after {0}s")]
    HealthTimeout(u64),

    /// Container specification error
    #[error("container spec error: {0}")]
    Spec(String),

    /// General error
    #[error("container error: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;
