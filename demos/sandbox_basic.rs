//! Basic sandbox usage example.
//!
//! Demonstrates the core session flow:
//! - Initializing the controller
//! - Creating a session (starts a worker container)
//! - Executing stateful code with streamed output
//! - Releasing the session
//!
//! Needs a running container engine and the worker image.
//! Run with: cargo run --example sandbox_basic --features containers

use cellbox::protocol::{ChunkKind, OutputChunk};
use cellbox::{SandboxConfig, SandboxManager};
use futures::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("cellbox=info")
        .init();

    println!("1. Connecting to the container engine...");
    let manager = SandboxManager::new(SandboxConfig::discover()?).await?;
    manager.initialize().await?;
    println!("   ✓ Engine reachable, network ensured\n");

    println!("2. Creating a session (this starts a worker container)...");
    let session_id = manager.create_session(None).await?;
    println!("   ✓ Session ready: {session_id}\n");

    println!("3. Defining state...");
    let mut stream = manager
        .execute(&session_id, "total = sum(range(10))", None)
        .await?;
    while stream.next().await.is_some() {}
    println!("   ✓ Defined `total`\n");

    println!("4. Using it in a later execution:");
    let mut stream = manager
        .execute(&session_id, "print(f'total is {total}')", Some("total"))
        .await?;
    while let Some(raw) = stream.next().await {
        if let Some(chunk) = OutputChunk::parse(&raw) {
            match chunk.kind {
                ChunkKind::Text => print!("   {}", chunk.payload),
                ChunkKind::Result => println!("   result: {}", chunk.payload),
                _ => {}
            }
        }
    }
    println!();

    println!("5. Releasing the session...");
    manager.release_session(&session_id).await;
    println!("   ✓ Container stopped and removed");

    Ok(())
}
