//! Registry and state-machine unit tests.

use super::*;

fn registry_with_session(id: &str) -> SessionRegistry {
    let registry = SessionRegistry::new();
    registry
        .create(
            "container-abc123def456".to_string(),
            "172.18.0.2".to_string(),
            Some(id.to_string()),
        )
        .unwrap();
    registry
}

#[test]
fn create_registers_in_creating_state() {
    let registry = registry_with_session("s1");
    let record = registry.get("s1").unwrap();

    assert_eq!(record.state, SessionState::Creating);
    assert_eq!(record.container_id, "container-abc123def456");
    assert_eq!(record.container_ip, "172.18.0.2");
    assert!(record.error_message.is_none());
    assert!(!record.is_active());
    assert!(!record.is_available());
}

#[test]
fn create_generates_unique_ids() {
    let registry = SessionRegistry::new();
    let a = registry
        .create("c1".to_string(), "".to_string(), None)
        .unwrap();
    let b = registry
        .create("c2".to_string(), "".to_string(), None)
        .unwrap();
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(registry.count(), 2);
}

#[test]
fn duplicate_id_rejected() {
    let registry = registry_with_session("dup");
    let err = registry
        .create("other".to_string(), "".to_string(), Some("dup".to_string()))
        .unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyExists(_)));
    // the original record is untouched
    assert_eq!(
        registry.get("dup").unwrap().container_id,
        "container-abc123def456"
    );
}

#[test]
fn full_lifecycle_walk() {
    let registry = registry_with_session("walk");

    assert!(registry.update_state("walk", SessionState::Ready, None));
    assert!(registry.get("walk").unwrap().is_available());

    assert!(registry.update_state("walk", SessionState::Executing, None));
    let record = registry.get("walk").unwrap();
    assert!(record.is_active());
    assert!(!record.is_available());

    assert!(registry.update_state("walk", SessionState::Ready, None));
    assert!(registry.update_state("walk", SessionState::Destroying, None));

    let released = registry.release("walk").unwrap();
    assert_eq!(released.state, SessionState::Destroyed);
    assert!(registry.get("walk").is_none());
    assert_eq!(registry.count(), 0);
}

#[test]
fn update_state_bumps_last_used() {
    let registry = registry_with_session("touch");
    let before = registry.get("touch").unwrap().last_used_at;

    std::thread::sleep(std::time::Duration::from_millis(5));
    registry.update_state("touch", SessionState::Ready, None);

    let after = registry.get("touch").unwrap().last_used_at;
    assert!(after > before);
}

#[test]
fn update_state_on_missing_session_is_false() {
    let registry = SessionRegistry::new();
    assert!(!registry.update_state("ghost", SessionState::Ready, None));
}

#[test]
fn error_state_records_message() {
    let registry = registry_with_session("err");
    registry.update_state(
        "err",
        SessionState::Error,
        Some("health check failed".to_string()),
    );

    let record = registry.get("err").unwrap();
    assert_eq!(record.state, SessionState::Error);
    assert_eq!(record.error_message.as_deref(), Some("health check failed"));
}

#[test]
fn release_is_idempotent() {
    let registry = registry_with_session("once");
    assert!(registry.release("once").is_some());
    assert!(registry.release("once").is_none());
}

#[test]
fn active_counts_ready_and_executing() {
    let registry = SessionRegistry::new();
    for (id, state) in [
        ("a", Some(SessionState::Ready)),
        ("b", Some(SessionState::Executing)),
        ("c", None), // stays Creating
        ("d", Some(SessionState::Destroying)),
    ] {
        registry
            .create(
                format!("container-{id}"),
                "".to_string(),
                Some(id.to_string()),
            )
            .unwrap();
        if let Some(state) = state {
            registry.update_state(id, state, None);
        }
    }

    assert_eq!(registry.count(), 4);
    assert_eq!(registry.count_active(), 2);
    let active: Vec<String> = registry
        .active()
        .into_iter()
        .map(|r| r.session_id)
        .collect();
    assert!(active.contains(&"a".to_string()));
    assert!(active.contains(&"b".to_string()));
}

#[test]
fn by_container_finds_owner() {
    let registry = registry_with_session("owner");
    let found = registry.by_container("container-abc123def456").unwrap();
    assert_eq!(found.session_id, "owner");
    assert!(registry.by_container("container-unknown").is_none());
}

#[test]
fn set_container_ip_populates_record() {
    let registry = SessionRegistry::new();
    registry
        .create("c1".to_string(), String::new(), Some("ip".to_string()))
        .unwrap();
    assert!(registry.set_container_ip("ip", "172.18.0.9"));
    assert_eq!(registry.get("ip").unwrap().container_ip, "172.18.0.9");
    assert!(!registry.set_container_ip("ghost", "10.0.0.1"));
}

#[test]
fn session_info_view_serializes() {
    let registry = registry_with_session("info");
    registry.update_state("info", SessionState::Ready, None);

    let record = registry.get("info").unwrap();
    let info = SessionInfo::from(&record);
    let json = serde_json::to_value(&info).unwrap();

    assert_eq!(json["session_id"], "info");
    assert_eq!(json["state"], "ready");
    assert!(json.get("error_message").is_none());
}
