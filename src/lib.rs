//! # cellbox
//!
//! A multi-tenant code-execution sandbox. A controller leases isolated,
//! stateful execution environments ("sessions") backed 1:1 by containerized
//! worker processes, dispatches code fragments into them, streams live
//! output back as tagged chunks, and reclaims the container on release.
//! Variables defined in one call persist into the next within a session;
//! sessions never see each other.
//!
//! ## Architecture Overview
//!
//! - **[`manager`]**: the controller: session lifecycle, per-session
//!   mutual exclusion, request routing, orphan reaping
//! - **[`session`]**: session records, the state machine, and the
//!   in-memory registry
//! - **[`container`]**: Docker/Podman driver with the worker hardening
//!   contract (requires the `containers` feature)
//! - **[`worker`]**: the in-container process: HTTP/SSE surface over an
//!   embedded stateful Python interpreter, output capture, dirty-variable
//!   rollback, result serialization (requires the `worker` feature)
//! - **[`protocol`]**: the chunk vocabulary and wire types shared by both
//!   sides
//! - **[`config`]**: TOML configuration with discovery hierarchy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cellbox::{SandboxConfig, SandboxManager};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = SandboxManager::new(SandboxConfig::discover()?).await?;
//!     manager.initialize().await?;
//!
//!     let session_id = manager.create_session(None).await?;
//!     let mut stream = manager.execute(&session_id, "print('hello')", None).await?;
//!     while let Some(chunk) = stream.next().await {
//!         println!("{chunk}");
//!     }
//!
//!     manager.release_session(&session_id).await;
//!     Ok(())
//! }
//! ```

/// Sandbox configuration with TOML discovery.
pub mod config;

/// Wire vocabulary: tagged chunks, execution results, worker request and
/// response bodies, SSE framing.
pub mod protocol;

/// Session records, state machine, and the concurrent registry.
pub mod session;

/// Container engine layer (Docker/Podman via bollard).
///
/// This module is only available with the `containers` feature enabled.
#[cfg(feature = "containers")]
pub mod container;

/// The sandbox controller: session lifecycle and execution routing.
#[cfg(feature = "containers")]
pub mod manager;

/// The per-session worker process: HTTP surface, embedded interpreter,
/// output capture, and result serialization.
///
/// This module is only available with the `worker` feature enabled.
#[cfg(feature = "worker")]
pub mod worker;

// Re-export the main configuration type
pub use config::SandboxConfig;

// Re-export the wire types clients touch
pub use protocol::{ChunkKind, ExecStatus, ExecutionResult, OutputChunk};

// Re-export session views
pub use session::{SessionInfo, SessionRegistry, SessionState};

// Re-export the controller surface (only with the containers feature)
#[cfg(feature = "containers")]
pub use container::{ContainerDriver, ContainerError, VolumeBinding};
#[cfg(feature = "containers")]
pub use manager::{ExecutionStream, SandboxError, SandboxManager};
