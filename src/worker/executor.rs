//! Stateful Python executor.
//!
//! One executor per worker process. User bindings persist in a dedicated
//! globals namespace across executions; a failed execution rolls back every
//! name it introduced. Compilation happens before execution so parse errors
//! can never touch the namespace.

use crate::protocol::ExecutionResult;
use crate::worker::capture::{OutputCapture, OutputSink};
use crate::worker::serializer::serialize_variable;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::collections::HashSet;
use std::ffi::CString;
use std::time::Instant;
use tracing::{debug, warn};

/// Names present in a fresh namespace that are never listed as user
/// variables nor rolled back.
const BASELINE_NAMES: &[&str] = &[
    "__name__",
    "__doc__",
    "__package__",
    "__loader__",
    "__spec__",
    "__builtins__",
    "__annotations__",
    // Preloaded utility names
    "warnings",
    "matplotlib",
];

/// Run on startup and after every reset: silence warning noise and pin a
/// non-interactive plotting backend.
const PRELOAD: &str = "import warnings\n\
warnings.filterwarnings('ignore')\n\
try:\n\
    import matplotlib\n\
    matplotlib.use('Agg')\n\
except ImportError:\n\
    pass\n";

/// The embedded interpreter and its persistent namespace.
pub struct PythonExecutor {
    globals: Py<PyDict>,
    baseline: HashSet<String>,
    execution_count: u64,
}

enum RunOutcome {
    Completed,
    /// Failed before execution (syntax/parse); the namespace is untouched.
    FailedBeforeExec(PyErr),
    /// Raised at runtime; new bindings must be rolled back.
    FailedInExec(PyErr),
}

impl PythonExecutor {
    /// Initialize the interpreter, run the preload, and record the baseline.
    pub fn new() -> PyResult<Self> {
        Python::with_gil(|py| {
            let globals = PyDict::new(py);
            globals.set_item("__name__", "__main__")?;

            if let Err(e) = run_source(py, &globals, PRELOAD) {
                // Preload failures are tolerated; the namespace still works.
                debug!("Preload failed: {}", e);
            }

            let mut baseline: HashSet<String> =
                BASELINE_NAMES.iter().map(|s| s.to_string()).collect();
            baseline.extend(current_keys(&globals));

            Ok(Self {
                globals: globals.unbind(),
                baseline,
                execution_count: 0,
            })
        })
    }

    /// Execute one code fragment.
    ///
    /// Captured stdout/stderr writes flow through `sink` while the code
    /// runs; the caller appends the terminal result chunk itself. On a
    /// runtime error every name introduced by this execution is deleted; a
    /// parse error leaves the namespace untouched.
    pub fn run_code(
        &mut self,
        code: &str,
        result_var: Option<&str>,
        sink: &OutputSink,
    ) -> ExecutionResult {
        let start = Instant::now();
        self.execution_count += 1;

        Python::with_gil(|py| {
            let globals = self.globals.bind(py);
            let keys_before = current_keys(globals);

            let capture = match OutputCapture::install(py, sink.clone()) {
                Ok(capture) => Some(capture),
                Err(e) => {
                    warn!("Failed to install output capture: {}", e);
                    None
                }
            };

            let outcome = run_cell(py, globals, code);

            if let Some(capture) = capture {
                if let Err(e) = capture.restore(py) {
                    warn!("Failed to restore output streams: {}", e);
                }
            }

            let elapsed = start.elapsed().as_secs_f64();
            match outcome {
                RunOutcome::Completed => {
                    let return_value = result_var.and_then(|var| {
                        globals
                            .get_item(var)
                            .ok()
                            .flatten()
                            .filter(|value| !value.is_none())
                            .map(|value| serialize_variable(&value, var))
                    });
                    ExecutionResult::success(elapsed, return_value)
                }
                RunOutcome::FailedBeforeExec(err) => {
                    let (error_type, error_message, traceback) = error_details(py, err);
                    ExecutionResult::failure(elapsed, error_type, error_message, traceback)
                }
                RunOutcome::FailedInExec(err) => {
                    rollback_dirty(globals, &keys_before, &self.baseline);
                    let (error_type, error_message, traceback) = error_details(py, err);
                    ExecutionResult::failure(elapsed, error_type, error_message, traceback)
                }
            }
        })
    }

    /// Drop every user binding, re-run the preload, and restart the
    /// execution counter.
    pub fn reset(&mut self) -> PyResult<()> {
        Python::with_gil(|py| {
            let globals = self.globals.bind(py);
            for key in current_keys(globals) {
                if !self.baseline.contains(&key) {
                    let _ = globals.del_item(&key);
                }
            }
            if let Err(e) = run_source(py, globals, PRELOAD) {
                debug!("Preload failed on reset: {}", e);
            }
            Ok::<(), PyErr>(())
        })?;

        self.execution_count = 0;
        Ok(())
    }

    /// Serialized descriptor of one user variable, if bound.
    pub fn variable(&self, name: &str) -> Option<serde_json::Value> {
        Python::with_gil(|py| {
            let globals = self.globals.bind(py);
            globals
                .get_item(name)
                .ok()
                .flatten()
                .map(|value| serialize_variable(&value, name))
        })
    }

    pub fn has_variable(&self, name: &str) -> bool {
        Python::with_gil(|py| {
            self.globals
                .bind(py)
                .contains(name)
                .unwrap_or(false)
        })
    }

    /// User-defined names, baseline excluded, sorted for stable output.
    pub fn list_variables(&self) -> Vec<String> {
        Python::with_gil(|py| {
            let globals = self.globals.bind(py);
            let mut names: Vec<String> = current_keys(globals)
                .into_iter()
                .filter(|key| !self.baseline.contains(key))
                .collect();
            names.sort();
            names
        })
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }
}

/// Compile then execute, distinguishing parse failures from runtime ones.
fn run_cell(py: Python<'_>, globals: &Bound<'_, PyDict>, code: &str) -> RunOutcome {
    let builtins = match py.import("builtins") {
        Ok(builtins) => builtins,
        Err(e) => return RunOutcome::FailedBeforeExec(e),
    };

    let compiled = match builtins
        .getattr("compile")
        .and_then(|compile| compile.call1((code, "<session>", "exec")))
    {
        Ok(compiled) => compiled,
        Err(e) => return RunOutcome::FailedBeforeExec(e),
    };

    match builtins
        .getattr("exec")
        .and_then(|exec| exec.call1((&compiled, globals)))
    {
        Ok(_) => RunOutcome::Completed,
        Err(e) => RunOutcome::FailedInExec(e),
    }
}

fn run_source(py: Python<'_>, globals: &Bound<'_, PyDict>, source: &str) -> PyResult<()> {
    let source = CString::new(source)
        .map_err(|e| pyo3::exceptions::PyValueError::new_err(e.to_string()))?;
    py.run(source.as_c_str(), Some(globals), None)
}

fn current_keys(globals: &Bound<'_, PyDict>) -> HashSet<String> {
    globals
        .keys()
        .iter()
        .filter_map(|key| key.extract::<String>().ok())
        .collect()
}

/// Delete names introduced since `keys_before`, baseline excepted.
fn rollback_dirty(
    globals: &Bound<'_, PyDict>,
    keys_before: &HashSet<String>,
    baseline: &HashSet<String>,
) {
    let keys_after = current_keys(globals);
    for key in keys_after.difference(keys_before) {
        if !baseline.contains(key) {
            let _ = globals.del_item(key);
        }
    }
}

/// Extract (class name, message, formatted traceback) from an error.
fn error_details(py: Python<'_>, err: PyErr) -> (String, String, Option<String>) {
    let error_type = err
        .get_type(py)
        .getattr("__name__")
        .and_then(|name| name.extract::<String>())
        .unwrap_or_else(|_| "Exception".to_string());
    let error_message = err.value(py).to_string();

    let traceback = match err.traceback(py).and_then(|tb| tb.format().ok()) {
        Some(tb) => Some(format!("{tb}{error_type}: {error_message}")),
        None => Some(format!("{error_type}: {error_message}")),
    };

    (error_type, error_message, traceback)
}
