//! In-memory session registry.
//!
//! Maps session ids to [`SessionRecord`]s with atomic, non-blocking
//! operations. The registry never does I/O; container work belongs to the
//! manager.

use super::types::{SessionRecord, SessionState};
use dashmap::DashMap;
use tracing::{debug, info, warn};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} already exists")]
    AlreadyExists(String),
}

/// Concurrent session-id → record map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh session id.
    pub fn generate_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Register a new session in `Creating` state.
    ///
    /// A caller-provided id must be unique across the registry.
    pub fn create(
        &self,
        container_id: String,
        container_ip: String,
        session_id: Option<String>,
    ) -> Result<SessionRecord, RegistryError> {
        let session_id = session_id.unwrap_or_else(Self::generate_session_id);

        let entry = self.sessions.entry(session_id.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyExists(session_id))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let record = SessionRecord::new(session_id.clone(), container_id, container_ip);
                vacant.insert(record.clone());
                info!(
                    "Created session: {} -> container {}",
                    session_id,
                    &record.container_id[..record.container_id.len().min(12)]
                );
                Ok(record)
            }
        }
    }

    /// Snapshot of one record.
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|r| r.clone())
    }

    /// Transition a session to `state`, bumping `last_used_at`.
    ///
    /// Returns false when the record is absent.
    pub fn update_state(
        &self,
        session_id: &str,
        state: SessionState,
        error_message: Option<String>,
    ) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut record) => {
                let old_state = record.state;
                record.state = state;
                record.touch();
                if let Some(message) = error_message {
                    record.error_message = Some(message);
                }
                debug!("Session {} state: {} -> {}", session_id, old_state, state);
                true
            }
            None => {
                warn!("Session {} not found for state update", session_id);
                false
            }
        }
    }

    /// Write the container address into a record once the container is up.
    pub fn set_container_ip(&self, session_id: &str, container_ip: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut record) => {
                record.container_ip = container_ip.to_string();
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a session from the registry, returning the record marked
    /// `Destroyed`.
    pub fn release(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.remove(session_id).map(|(_, mut record)| {
            record.state = SessionState::Destroyed;
            record.touch();
            info!("Released session: {}", session_id);
            record
        })
    }

    /// All records, unordered snapshot.
    pub fn all(&self) -> Vec<SessionRecord> {
        self.sessions.iter().map(|r| r.clone()).collect()
    }

    /// Records in Ready or Executing state.
    pub fn active(&self) -> Vec<SessionRecord> {
        self.sessions
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn count_active(&self) -> usize {
        self.sessions.iter().filter(|r| r.is_active()).count()
    }

    /// Find the session bound to a container, if any.
    pub fn by_container(&self, container_id: &str) -> Option<SessionRecord> {
        self.sessions
            .iter()
            .find(|r| r.container_id == container_id)
            .map(|r| r.clone())
    }
}
