//! Worker binary: runs inside each worker container.
//!
//! Brings up the embedded interpreter and serves the execution HTTP surface
//! on all interfaces. The listen port comes from `CELLBOX_WORKER_PORT`
//! (default 9000); other environment variables pass through to the
//! interpreter untouched.

use anyhow::Context;
use cellbox::worker::{WorkerState, router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const DEFAULT_PORT: u16 = 9000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cellbox=info".to_string()),
        )
        .init();

    let port = std::env::var("CELLBOX_WORKER_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    info!("Initializing Python executor...");
    let state = Arc::new(WorkerState::new()?);
    info!("Python executor initialized");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Worker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
