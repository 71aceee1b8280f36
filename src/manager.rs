//! The sandbox controller.
//!
//! [`SandboxManager`] owns session lifecycle end to end: provisioning a
//! worker container per session, routing executions to it over streamed
//! HTTP, and reclaiming the container on release. Per-session mutual
//! exclusion guarantees at most one in-flight execution per session; the
//! registry's state machine tracks everything else.

use crate::config::SandboxConfig;
use crate::container::{ContainerClient, ContainerDriver, ContainerError, VolumeBinding};
use crate::protocol::{ExecRequest, SseEventBuffer};
use crate::session::{RegistryError, SessionInfo, SessionRegistry, SessionState};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

/// Grace period given to a worker container on release.
const RELEASE_STOP_GRACE: Duration = Duration::from_secs(10);

/// Controller-level errors.
///
/// Worker-side interpreter failures are not errors here; they arrive as
/// error-shaped result chunks on the execution stream. Only transport and
/// lifecycle failures surface through this type.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {id} is not available (state: {state})")]
    Unavailable { id: String, state: SessionState },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Ordered stream of raw `<tag>...</tag>` chunks from one execution.
///
/// Dropping the stream aborts the relay; the session still returns to
/// Ready and its lock is released.
#[derive(Debug)]
pub struct ExecutionStream {
    rx: mpsc::UnboundedReceiver<String>,
}

impl futures::Stream for ExecutionStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl ExecutionStream {
    /// Collect every chunk (convenience for non-streaming callers and tests).
    pub async fn collect_all(mut self) -> Vec<String> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }
}

/// The public sandbox facade.
pub struct SandboxManager {
    config: SandboxConfig,
    driver: Arc<ContainerDriver>,
    registry: Arc<SessionRegistry>,
    /// Per-session execution locks, created lazily and discarded on release.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Monotonic counter feeding unique container names.
    container_counter: AtomicU64,
    /// Streaming client for worker `/exec` calls.
    http: reqwest::Client,
}

impl SandboxManager {
    /// Connect to the container engine and build a manager.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::EngineUnavailable`] when no engine answers.
    pub async fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let client = ContainerClient::connect().await?;
        Ok(Self::with_client(client, config))
    }

    /// Build a manager over an existing engine connection.
    pub fn with_client(client: ContainerClient, config: SandboxConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            driver: Arc::new(ContainerDriver::new(client, config.clone())),
            registry: Arc::new(SessionRegistry::new()),
            session_locks: DashMap::new(),
            container_counter: AtomicU64::new(0),
            http,
            config,
        }
    }

    /// Startup pass: verify the engine, ensure the network, reap orphans.
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        info!("Initializing sandbox manager...");

        self.driver.ping().await?;
        self.driver.ensure_network().await?;
        self.cleanup_orphan_containers().await?;

        info!("Sandbox manager initialized");
        Ok(())
    }

    fn next_container_name(&self) -> String {
        let n = self.container_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.config.container_prefix, n)
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a new session backed by a fresh worker container.
    ///
    /// The container is created, started, and health-polled before the
    /// session becomes Ready. Any failure on the way releases every
    /// resource acquired so far.
    pub async fn create_session(
        &self,
        volumes: Option<HashMap<String, VolumeBinding>>,
    ) -> Result<String, SandboxError> {
        let container_name = self.next_container_name();
        let session_id = SessionRegistry::generate_session_id();

        info!(
            "Creating session {} with container {}",
            session_id, container_name
        );

        let container_id = self
            .driver
            .create(&container_name, volumes.as_ref(), None)
            .await?;

        if let Err(e) =
            self.registry
                .create(container_id.clone(), String::new(), Some(session_id.clone()))
        {
            let _ = self.driver.remove(&container_id).await;
            return Err(e.into());
        }

        if let Err(e) = self.driver.start(&container_id).await {
            self.teardown_failed_create(&session_id, &container_id, &e.to_string())
                .await;
            return Err(e.into());
        }

        let container_ip = match self.driver.container_ip(&container_id).await {
            Ok(ip) => ip,
            Err(e) => {
                self.teardown_failed_create(&session_id, &container_id, &e.to_string())
                    .await;
                return Err(e.into());
            }
        };
        self.registry.set_container_ip(&session_id, &container_ip);

        if let Err(e) = self.driver.wait_healthy(&container_ip, None).await {
            self.teardown_failed_create(&session_id, &container_id, &e.to_string())
                .await;
            return Err(e.into());
        }

        self.registry
            .update_state(&session_id, SessionState::Ready, None);

        info!(
            "Session {} is ready (container IP: {})",
            session_id, container_ip
        );
        Ok(session_id)
    }

    async fn teardown_failed_create(&self, session_id: &str, container_id: &str, message: &str) {
        error!("Failed to create session {}: {}", session_id, message);
        self.registry
            .update_state(session_id, SessionState::Error, Some(message.to_string()));
        let _ = self.driver.stop(container_id, RELEASE_STOP_GRACE).await;
        let _ = self.driver.remove(container_id).await;
        self.registry.release(session_id);
        self.session_locks.remove(session_id);
    }

    /// Execute code in a session, streaming tagged output chunks back in
    /// worker order. The terminal chunk is always a `<result>` (or a single
    /// `<err>` on transport timeout).
    ///
    /// Holds the per-session lock for the lifetime of the returned stream;
    /// the session transitions Ready → Executing → Ready around it.
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        result_var: Option<&str>,
    ) -> Result<ExecutionStream, SandboxError> {
        let record = self
            .registry
            .get(session_id)
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;

        if !record.is_available() {
            return Err(SandboxError::Unavailable {
                id: session_id.to_string(),
                state: record.state,
            });
        }

        let lock = self.session_lock(session_id);
        let permit = lock.lock_owned().await;

        self.registry
            .update_state(session_id, SessionState::Executing, None);

        let url = format!(
            "http://{}:{}/exec",
            record.container_ip, self.config.worker_port
        );
        let request = ExecRequest {
            code: code.to_string(),
            result_var: result_var.map(String::from),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_execution(
            self.http.clone(),
            url,
            request,
            self.config.execution_timeout(),
            tx,
            Arc::clone(&self.registry),
            session_id.to_string(),
            permit,
        ));

        Ok(ExecutionStream { rx })
    }

    /// Release a session: stop and remove its container, drop the record
    /// and its lock. Idempotent; returns false when the session is absent.
    pub async fn release_session(&self, session_id: &str) -> bool {
        let Some(record) = self.registry.get(session_id) else {
            warn!("Session {} not found for release", session_id);
            return false;
        };

        info!("Releasing session {}", session_id);
        self.registry
            .update_state(session_id, SessionState::Destroying, None);

        // Stop/remove failures do not fail the release.
        match self.driver.get(&record.container_id).await {
            Ok(Some(_)) => {
                let _ = self
                    .driver
                    .stop(&record.container_id, RELEASE_STOP_GRACE)
                    .await;
                let _ = self.driver.remove(&record.container_id).await;
            }
            Ok(None) => {
                warn!(
                    "Container {} for session {} already gone",
                    record.container_id, session_id
                );
            }
            Err(e) => {
                warn!(
                    "Could not inspect container {} for session {}: {}",
                    record.container_id, session_id, e
                );
            }
        }

        self.registry.release(session_id);
        self.session_locks.remove(session_id);

        true
    }

    /// Public view of one session.
    pub fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.registry.get(session_id).map(|r| SessionInfo::from(&r))
    }

    /// Public views of every session.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry
            .all()
            .iter()
            .map(SessionInfo::from)
            .collect()
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Stop and remove containers whose name carries the configured prefix
    /// but which no session record claims. Returns how many were reaped.
    pub async fn cleanup_orphan_containers(&self) -> Result<usize, SandboxError> {
        let owned: HashSet<String> = self
            .registry
            .all()
            .into_iter()
            .map(|r| r.container_id)
            .collect();

        let orphans: Vec<String> = self
            .driver
            .list_by_prefix()
            .await?
            .into_iter()
            .filter(|c| !owned.contains(&c.id))
            .inspect(|c| {
                info!(
                    "Cleaning up orphan container: {} ({})",
                    c.name,
                    c.id.get(..12).unwrap_or(&c.id)
                );
            })
            .map(|c| c.id)
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }

        let reaped = self.driver.cleanup_containers(Some(&orphans)).await?;
        info!("Cleaned up {} orphan containers", reaped);
        Ok(reaped)
    }

    /// Release every live session, best-effort.
    pub async fn shutdown(&self) {
        info!("Shutting down sandbox manager...");

        for record in self.registry.all() {
            self.release_session(&record.session_id).await;
        }

        info!("Sandbox manager shutdown complete");
    }

    /// The configuration this manager runs under.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The container driver, for direct engine queries.
    pub fn driver(&self) -> &ContainerDriver {
        &self.driver
    }
}

/// Relays one `/exec` SSE response into the caller's channel, then restores
/// the session to Ready and drops the per-session lock. Runs to completion
/// even when the caller drops the [`ExecutionStream`].
#[allow(clippy::too_many_arguments)]
async fn relay_execution(
    http: reqwest::Client,
    url: String,
    request: ExecRequest,
    read_timeout: Duration,
    tx: mpsc::UnboundedSender<String>,
    registry: Arc<SessionRegistry>,
    session_id: String,
    permit: OwnedMutexGuard<()>,
) {
    let outcome = async {
        let response = match tokio::time::timeout(read_timeout, http.post(&url).json(&request).send())
            .await
        {
            Err(_) => return RelayOutcome::Timeout,
            Ok(Err(e)) => return RelayOutcome::Transport(e.to_string()),
            Ok(Ok(response)) => response,
        };

        let mut body = response.bytes_stream();
        let mut events = SseEventBuffer::new();

        loop {
            match tokio::time::timeout(read_timeout, body.next()).await {
                Err(_) => return RelayOutcome::Timeout,
                Ok(None) => return RelayOutcome::Complete,
                Ok(Some(Err(e))) => return RelayOutcome::Transport(e.to_string()),
                Ok(Some(Ok(bytes))) => {
                    for payload in events.feed(&bytes) {
                        if tx.send(payload).is_err() {
                            // Caller went away; stop reading.
                            return RelayOutcome::Complete;
                        }
                    }
                }
            }
        }
    }
    .await;

    match outcome {
        RelayOutcome::Complete => {}
        RelayOutcome::Timeout => {
            error!("Execution timeout for session {}", session_id);
            let _ = tx.send("<err>Execution timeout</err>".to_string());
        }
        RelayOutcome::Transport(message) => {
            error!("Execution error for session {}: {}", session_id, message);
            let _ = tx.send(format!("<err>{}</err>", message));
        }
    }

    registry.update_state(&session_id, SessionState::Ready, None);
    drop(permit);
}

enum RelayOutcome {
    Complete,
    Timeout,
    Transport(String),
}
