//! The per-session worker process.
//!
//! Runs inside each worker container: an HTTP surface over an embedded,
//! stateful CPython interpreter. Variables persist between `/exec` calls;
//! failed executions roll their new bindings back; output streams back as
//! tagged SSE chunks with a single terminal `<result>`.

mod capture;
mod executor;
mod serializer;
mod server;


pub use capture::{OutputCapture, OutputSink, StreamSink, push_image};
pub use executor::PythonExecutor;
pub use serializer::serialize_variable;
pub use server::{WorkerState, router};
