//! Session records and the session state machine data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
///
/// Valid walks: Creating → Ready ⇄ Executing → Destroying → Destroyed, with
/// Error reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Container is being provisioned
    Creating,
    /// Worker is healthy and idle
    Ready,
    /// An execution is in flight
    Executing,
    /// Release in progress
    Destroying,
    /// Released; the record is gone from the registry
    Destroyed,
    /// A fatal condition was recorded
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Creating => "creating",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Destroying => "destroying",
            SessionState::Destroyed => "destroyed",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One session's binding to its worker container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub container_id: String,
    /// Empty until the container has started and reported an address.
    pub container_ip: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl SessionRecord {
    pub fn new(session_id: String, container_id: String, container_ip: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            container_id,
            container_ip,
            state: SessionState::Creating,
            created_at: now,
            last_used_at: now,
            error_message: None,
        }
    }

    /// Bump `last_used_at` to now.
    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }

    /// Live (holds a container that should exist): Ready or Executing.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Ready | SessionState::Executing)
    }

    /// Can accept a new execution right now.
    pub fn is_available(&self) -> bool {
        self.state == SessionState::Ready
    }
}

/// Public view of a session, as returned by `GetSessionInfo`/`ListSessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub container_id: String,
    pub container_ip: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&SessionRecord> for SessionInfo {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            container_id: record.container_id.clone(),
            container_ip: record.container_ip.clone(),
            state: record.state,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            error_message: record.error_message.clone(),
        }
    }
}
