//! Interpreter output capture.
//!
//! Swaps the interpreter's `sys.stdout`/`sys.stderr` for sinks that echo to
//! the process streams (container logs stay useful) and enqueue every write
//! as a tagged chunk, in emission order. One capture per execution;
//! captures are not reused.

use crate::protocol::{ChunkKind, OutputChunk};
use pyo3::prelude::*;
use std::io::Write;
use tokio::sync::mpsc;

/// Channel end the worker hands to one execution's capture and executor.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

/// File-like object installed as `sys.stdout` or `sys.stderr`.
#[pyclass]
pub struct StreamSink {
    tx: OutputSink,
    kind: ChunkKind,
}

impl StreamSink {
    fn new(tx: OutputSink, kind: ChunkKind) -> Self {
        Self { tx, kind }
    }
}

#[pymethods]
impl StreamSink {
    /// Capture one write, echoing to the underlying process stream.
    fn write(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        match self.kind {
            ChunkKind::Error => {
                let _ = std::io::stderr().write_all(text.as_bytes());
            }
            _ => {
                let _ = std::io::stdout().write_all(text.as_bytes());
            }
        }

        // Receiver gone means the execution was abandoned; drop the output.
        let _ = self.tx.send(OutputChunk {
            kind: self.kind,
            payload: text.to_string(),
        });

        text.chars().count()
    }

    fn flush(&self) {
        match self.kind {
            ChunkKind::Error => {
                let _ = std::io::stderr().flush();
            }
            _ => {
                let _ = std::io::stdout().flush();
            }
        }
    }

    fn isatty(&self) -> bool {
        false
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }
}

/// Installed stream redirection for the duration of one execution.
pub struct OutputCapture {
    original_stdout: Py<PyAny>,
    original_stderr: Py<PyAny>,
}

impl OutputCapture {
    /// Redirect `sys.stdout` and `sys.stderr` into `sink`.
    pub fn install(py: Python<'_>, sink: OutputSink) -> PyResult<Self> {
        let sys = py.import("sys")?;
        let original_stdout = sys.getattr("stdout")?.unbind();
        let original_stderr = sys.getattr("stderr")?.unbind();

        sys.setattr(
            "stdout",
            Py::new(py, StreamSink::new(sink.clone(), ChunkKind::Text))?,
        )?;
        sys.setattr(
            "stderr",
            Py::new(py, StreamSink::new(sink, ChunkKind::Error))?,
        )?;

        Ok(Self {
            original_stdout,
            original_stderr,
        })
    }

    /// Restore the original streams.
    pub fn restore(&self, py: Python<'_>) -> PyResult<()> {
        let sys = py.import("sys")?;
        sys.setattr("stdout", self.original_stdout.bind(py))?;
        sys.setattr("stderr", self.original_stderr.bind(py))?;
        Ok(())
    }
}

/// Enqueue a base64 image chunk.
///
/// Reserved: the `<img>` tag is part of the wire vocabulary but nothing
/// produces images yet (the preload pins the Agg backend).
pub fn push_image(sink: &OutputSink, base64_data: String) {
    let _ = sink.send(OutputChunk::image(base64_data));
}
