//! Worker HTTP surface.
//!
//! Routes:
//! - `POST /exec`: run code, streaming tagged chunks as SSE; exactly one
//!   terminal `<result>` chunk carrying the execution result JSON
//! - `POST /reset`: drop user bindings, re-apply the preload
//! - `GET /health`: served from counters so it answers promptly even while
//!   an execution is running
//! - `GET /variables`: current user-defined names
//! - `GET /`: service identity

use crate::protocol::{
    ExecRequest, HealthResponse, OutputChunk, ResetResponse, VariablesResponse, frame_sse_event,
};
use crate::worker::executor::PythonExecutor;
use crate::protocol::ChunkKind;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info};

/// Shared worker state: the interpreter plus health gauges.
///
/// The interpreter mutex serializes executions (one session, one worker, one
/// in-flight execution); the gauges are updated after each execution so
/// `/health` never has to wait on it.
pub struct WorkerState {
    executor: Mutex<PythonExecutor>,
    execution_count: AtomicU64,
    variables_count: AtomicUsize,
}

impl WorkerState {
    /// Bring up the interpreter.
    pub fn new() -> anyhow::Result<Self> {
        let executor = PythonExecutor::new()
            .map_err(|e| anyhow::anyhow!("failed to initialize Python executor: {e}"))?;

        Ok(Self {
            executor: Mutex::new(executor),
            execution_count: AtomicU64::new(0),
            variables_count: AtomicUsize::new(0),
        })
    }
}

/// Build the worker router.
pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/", get(identity))
        .route("/exec", post(exec))
        .route("/reset", post(reset))
        .route("/health", get(health))
        .route("/variables", get(variables))
        .with_state(state)
}

async fn identity() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "cellbox-worker",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "execute": "POST /exec",
            "reset": "POST /reset",
            "health": "GET /health",
            "variables": "GET /variables",
        },
    }))
}

async fn exec(State(state): State<Arc<WorkerState>>, Json(request): Json<ExecRequest>) -> Response {
    let preview: String = request.code.chars().take(100).collect();
    info!("Executing code: {}...", preview);

    let (tx, rx) = mpsc::unbounded_channel::<OutputChunk>();

    // The interpreter call blocks; run it off the event loop so captured
    // chunks flush to the stream while the code is still running.
    let blocking_state = Arc::clone(&state);
    tokio::task::spawn_blocking(move || {
        let mut executor = blocking_state.executor.blocking_lock();
        let result = executor.run_code(&request.code, request.result_var.as_deref(), &tx);

        blocking_state
            .execution_count
            .store(executor.execution_count(), Ordering::Relaxed);
        blocking_state
            .variables_count
            .store(executor.list_variables().len(), Ordering::Relaxed);

        // Terminal chunk, always last.
        let _ = tx.send(OutputChunk::result(result.to_json()));
    });

    Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(ExecutionBody { rx, finished: false }))
        .unwrap_or_else(|_| ().into_response())
}

/// SSE body for one execution.
///
/// Frames each chunk as an SSE event and ends the stream right after the
/// terminal result chunk. Ending on the result rather than on channel close
/// keeps the response finite even if user code stashed a reference to the
/// captured `sys.stdout` sink.
struct ExecutionBody {
    rx: mpsc::UnboundedReceiver<OutputChunk>,
    finished: bool,
}

impl futures::Stream for ExecutionBody {
    type Item = Result<String, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.kind == ChunkKind::Result {
                    self.finished = true;
                }
                Poll::Ready(Some(Ok(frame_sse_event(&chunk.to_sse()))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn reset(State(state): State<Arc<WorkerState>>) -> Json<ResetResponse> {
    let mut executor = state.executor.lock().await;

    match executor.reset() {
        Ok(()) => {
            state
                .execution_count
                .store(executor.execution_count(), Ordering::Relaxed);
            state.variables_count.store(0, Ordering::Relaxed);
            info!("Executor state reset");
            Json(ResetResponse {
                success: true,
                message: "Executor state reset successfully".to_string(),
            })
        }
        Err(e) => {
            error!("Reset failed: {}", e);
            Json(ResetResponse {
                success: false,
                message: format!("Reset failed: {e}"),
            })
        }
    }
}

async fn health(State(state): State<Arc<WorkerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        executor_ready: true,
        execution_count: state.execution_count.load(Ordering::Relaxed),
        variables_count: state.variables_count.load(Ordering::Relaxed),
    })
}

async fn variables(State(state): State<Arc<WorkerState>>) -> Json<VariablesResponse> {
    let executor = state.executor.lock().await;
    let variables = executor.list_variables();
    Json(VariablesResponse {
        count: variables.len(),
        variables,
    })
}
