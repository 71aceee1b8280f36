//! End-to-end sandbox integration tests.
//!
//! These tests exercise the full controller → container → worker pipeline
//! and need a running Docker/Podman daemon plus the worker image
//! (`cellbox/worker:latest`, see docker/worker.Dockerfile). Tests are
//! skipped if no engine is available or SKIP_CONTAINER_TESTS=1.

#![cfg(feature = "containers")]

use cellbox::protocol::{ChunkKind, ExecutionResult, OutputChunk};
use cellbox::{SandboxConfig, SandboxManager};
use futures::StreamExt;
use serial_test::serial;
use test_tag::tag;

/// Check if container tests should run.
fn should_run_container_tests() -> bool {
    if let Ok(value) = std::env::var("SKIP_CONTAINER_TESTS") {
        if value == "1" || value.eq_ignore_ascii_case("true") {
            return false;
        }
    }

    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
        || std::process::Command::new("podman")
            .arg("info")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
}

fn test_config() -> SandboxConfig {
    let mut config = SandboxConfig::default();
    config.container_prefix = "cellbox-test-worker".to_string();
    config.network_name = "cellbox-test-network".to_string();
    config.health_check_timeout = 60;
    config
}

async fn test_manager() -> SandboxManager {
    let manager = SandboxManager::new(test_config())
        .await
        .expect("failed to connect to container engine");
    manager.initialize().await.expect("initialize failed");
    manager
}

/// Drain one execution and split it into (payload chunks, terminal result).
async fn collect_execution(
    manager: &SandboxManager,
    session_id: &str,
    code: &str,
    result_var: Option<&str>,
) -> (Vec<OutputChunk>, ExecutionResult) {
    let stream = manager
        .execute(session_id, code, result_var)
        .await
        .expect("execute failed");
    let raw: Vec<String> = stream.collect().await;

    let chunks: Vec<OutputChunk> = raw
        .iter()
        .map(|r| OutputChunk::parse(r).unwrap_or_else(|| panic!("unparseable chunk: {r}")))
        .collect();

    let last = chunks.last().expect("empty execution stream");
    assert_eq!(
        last.kind,
        ChunkKind::Result,
        "terminal chunk must be a result, got: {:?}",
        last
    );
    let result: ExecutionResult =
        serde_json::from_str(&last.payload).expect("result chunk is not valid JSON");

    (chunks, result)
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn variable_persistence_across_executions() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (engine unavailable or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let manager = test_manager().await;
    let session = manager.create_session(None).await.unwrap();

    let (_, result) = collect_execution(&manager, &session, "x = 1", None).await;
    assert!(result.success);

    let (_, result) = collect_execution(&manager, &session, "x = x + 41", Some("x")).await;
    assert!(result.success);
    let value = result.return_value.unwrap();
    assert_eq!(value["name"], "x");
    assert_eq!(value["type"], "int");
    assert_eq!(value["value"], 42);

    assert!(manager.release_session(&session).await);
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn runtime_error_rollback() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    let session = manager.create_session(None).await.unwrap();

    let (_, result) = collect_execution(&manager, &session, "clean_var = 'keep'", None).await;
    assert!(result.success);

    let (_, result) = collect_execution(
        &manager,
        &session,
        "dirty_var = 'gone'\nraise ValueError('boom')",
        None,
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.error_type.as_deref(), Some("ValueError"));

    // The session stays usable and the dirty binding is gone
    let (chunks, result) = collect_execution(
        &manager,
        &session,
        "print(sorted(v for v in dir() if not v.startswith('_')))",
        None,
    )
    .await;
    assert!(result.success);
    let text: String = chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::Text)
        .map(|c| c.payload.as_str())
        .collect();
    assert!(text.contains("clean_var"));
    assert!(!text.contains("dirty_var"));

    manager.release_session(&session).await;
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn syntax_error_is_reported() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    let session = manager.create_session(None).await.unwrap();

    let (_, result) = collect_execution(&manager, &session, "def broken(", None).await;
    assert!(!result.success);
    assert_eq!(result.error_type.as_deref(), Some("SyntaxError"));

    manager.release_session(&session).await;
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn streamed_output_order() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    let session = manager.create_session(None).await.unwrap();

    let (chunks, result) =
        collect_execution(&manager, &session, "for i in range(3):\n    print(i)", None).await;
    assert!(result.success);

    let text: String = chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::Text)
        .map(|c| c.payload.as_str())
        .collect();
    let zero = text.find('0').expect("missing 0");
    let one = text.find('1').expect("missing 1");
    let two = text.find('2').expect("missing 2");
    assert!(zero < one && one < two, "chunks out of order: {text:?}");

    manager.release_session(&session).await;
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox, slow)]
async fn dataframe_result_descriptor() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    let session = manager.create_session(None).await.unwrap();

    let (_, result) = collect_execution(
        &manager,
        &session,
        "import pandas as pd\ndf = pd.DataFrame({'a': [1, 2, 3]})",
        Some("df"),
    )
    .await;
    assert!(result.success);

    let value = result.return_value.unwrap();
    assert_eq!(value["type"], "DataFrame");
    assert_eq!(value["shape"], serde_json::json!([3, 1]));
    assert_eq!(value["preview_rows"], 3);
    assert_eq!(value["column_names"], serde_json::json!(["a"]));

    manager.release_session(&session).await;
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox, slow)]
async fn sessions_are_isolated() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    let s1 = manager.create_session(None).await.unwrap();
    let s2 = manager.create_session(None).await.unwrap();

    collect_execution(&manager, &s1, "x = 10", None).await;
    collect_execution(&manager, &s2, "x = 20", None).await;

    let (chunks, _) = collect_execution(&manager, &s1, "print(x)", None).await;
    let text: String = chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::Text)
        .map(|c| c.payload.as_str())
        .collect();
    assert!(text.contains("10"));

    let (chunks, _) = collect_execution(&manager, &s2, "print(x)", None).await;
    let text: String = chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::Text)
        .map(|c| c.payload.as_str())
        .collect();
    assert!(text.contains("20"));

    manager.release_session(&s1).await;
    manager.release_session(&s2).await;
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn release_is_idempotent_and_removes_container() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    let session = manager.create_session(None).await.unwrap();
    let info = manager.get_session_info(&session).unwrap();
    assert!(!info.container_id.is_empty());

    // The session's container exists while the session is live
    let found = manager.driver().get(&info.container_id).await.unwrap();
    assert!(found.is_some());

    assert!(manager.release_session(&session).await);
    assert!(!manager.release_session(&session).await);
    assert!(manager.get_session_info(&session).is_none());

    // ... and is gone after release
    let found = manager.driver().get(&info.container_id).await.unwrap();
    assert!(found.is_none());
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn execute_on_released_session_is_not_found() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    let session = manager.create_session(None).await.unwrap();
    manager.release_session(&session).await;

    let err = manager.execute(&session, "x = 1", None).await.unwrap_err();
    assert!(matches!(err, cellbox::SandboxError::NotFound(_)));
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn orphan_containers_are_reaped_on_initialize() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    // First manager leaks a session by dropping its registry without release
    let leaky = SandboxManager::new(test_config()).await.unwrap();
    leaky.initialize().await.unwrap();
    let _orphaned = leaky.create_session(None).await.unwrap();
    drop(leaky);

    // A fresh manager reaps the leftover container on initialize
    let manager = SandboxManager::new(test_config()).await.unwrap();
    manager.initialize().await.unwrap();

    let reaped_again = manager.cleanup_orphan_containers().await.unwrap();
    assert_eq!(reaped_again, 0, "initialize should have reaped everything");
}

#[tokio::test]
#[serial]
#[tag(integration, sandbox)]
async fn shutdown_releases_every_session() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = test_manager().await;
    manager.create_session(None).await.unwrap();
    manager.create_session(None).await.unwrap();
    assert_eq!(manager.session_count(), 2);

    manager.shutdown().await;
    assert_eq!(manager.session_count(), 0);
}
