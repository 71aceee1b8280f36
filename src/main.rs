use anyhow::Context;
use cellbox::container::VolumeBinding;
use cellbox::protocol::{ChunkKind, OutputChunk};
use cellbox::{SandboxConfig, SandboxManager};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "cellbox", version, about = "Multi-tenant code-execution sandbox")]
struct Cli {
    /// Path to a configuration file (defaults to the discovery hierarchy)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify the container engine, ensure the network, reap orphan workers
    Init,

    /// Run a code fragment in a fresh one-shot session and stream its output
    Run {
        /// Code to execute (mutually exclusive with --file)
        #[arg(long, conflicts_with = "file")]
        code: Option<String>,

        /// File containing the code to execute
        #[arg(long)]
        file: Option<PathBuf>,

        /// Variable to serialize into the terminal result
        #[arg(long)]
        result_var: Option<String>,

        /// Mount a host directory read-write at the configured data path
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// List containers matching the worker prefix and reap the orphans
    Reap,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cellbox=info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SandboxConfig::from_toml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SandboxConfig::discover()?,
    };

    if !config.enabled {
        anyhow::bail!("sandbox is disabled in configuration (enabled = false)");
    }

    match cli.command {
        Command::Init => {
            let manager = SandboxManager::new(config).await?;
            manager.initialize().await?;
            println!("Sandbox ready: engine reachable, network ensured, orphans reaped.");
            Ok(())
        }
        Command::Run {
            code,
            file,
            result_var,
            data,
        } => {
            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => anyhow::bail!("one of --code or --file is required"),
            };
            run_once(config, &code, result_var.as_deref(), data).await
        }
        Command::Reap => {
            let manager = SandboxManager::new(config).await?;
            let reaped = manager.cleanup_orphan_containers().await?;
            println!("Reaped {reaped} orphan containers.");
            Ok(())
        }
    }
}

/// Create a session, execute once, print the stream, release.
async fn run_once(
    config: SandboxConfig,
    code: &str,
    result_var: Option<&str>,
    data: Option<PathBuf>,
) -> anyhow::Result<()> {
    let data_mount_path = config.data_mount_path.clone();
    let manager = SandboxManager::new(config).await?;
    manager.initialize().await?;

    let volumes = data.map(|path| {
        let mut volumes = HashMap::new();
        volumes.insert(
            path.display().to_string(),
            VolumeBinding {
                bind: data_mount_path,
                mode: "rw".to_string(),
            },
        );
        volumes
    });

    let session_id = manager.create_session(volumes).await?;
    info!("Session {} created", session_id);

    let mut stream = manager.execute(&session_id, code, result_var).await?;
    while let Some(raw) = stream.next().await {
        match OutputChunk::parse(&raw) {
            Some(chunk) => match chunk.kind {
                ChunkKind::Text => {
                    print!("{}", chunk.payload);
                    std::io::stdout().flush().ok();
                }
                ChunkKind::Error => {
                    eprint!("{}", chunk.payload);
                    std::io::stderr().flush().ok();
                }
                ChunkKind::Image => {
                    eprintln!("[image chunk: {} bytes of base64]", chunk.payload.len());
                }
                ChunkKind::Result => {
                    let pretty = serde_json::from_str::<serde_json::Value>(&chunk.payload)
                        .and_then(|v| serde_json::to_string_pretty(&v))
                        .unwrap_or(chunk.payload);
                    println!("\n--- result ---\n{pretty}");
                }
            },
            None => eprintln!("[unrecognized chunk] {raw}"),
        }
    }

    manager.release_session(&session_id).await;
    Ok(())
}
