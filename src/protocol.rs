//! Wire vocabulary shared by the controller and the worker.
//!
//! Execution output travels as tagged chunks (`<txt>...</txt>`,
//! `<err>...</err>`, `<img>...</img>`, `<result>...</result>`) carried as
//! SSE `data:` events.
//! The controller relays chunk payloads verbatim; only clients and tests need
//! to look inside them.

use serde::{Deserialize, Serialize};

/// Kind of a streamed output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Interpreter standard output
    Text,
    /// Interpreter standard error
    Error,
    /// Base64-encoded image (reserved; nothing emits these yet)
    Image,
    /// Terminal execution result, exactly one per execution
    Result,
}

impl ChunkKind {
    /// The tag name used on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            ChunkKind::Text => "txt",
            ChunkKind::Error => "err",
            ChunkKind::Image => "img",
            ChunkKind::Result => "result",
        }
    }

    /// Reverse lookup from a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "txt" => Some(ChunkKind::Text),
            "err" => Some(ChunkKind::Error),
            "img" => Some(ChunkKind::Image),
            "result" => Some(ChunkKind::Result),
            _ => None,
        }
    }
}

/// A single fragment of streamed execution output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub kind: ChunkKind,
    pub payload: String,
}

impl OutputChunk {
    pub fn text<S: Into<String>>(payload: S) -> Self {
        Self {
            kind: ChunkKind::Text,
            payload: payload.into(),
        }
    }

    pub fn error<S: Into<String>>(payload: S) -> Self {
        Self {
            kind: ChunkKind::Error,
            payload: payload.into(),
        }
    }

    pub fn image<S: Into<String>>(payload: S) -> Self {
        Self {
            kind: ChunkKind::Image,
            payload: payload.into(),
        }
    }

    pub fn result<S: Into<String>>(payload: S) -> Self {
        Self {
            kind: ChunkKind::Result,
            payload: payload.into(),
        }
    }

    /// Render as the tagged wire form, e.g. `<txt>hello</txt>`.
    pub fn to_sse(&self) -> String {
        let tag = self.kind.tag();
        format!("<{tag}>{}</{tag}>", self.payload)
    }

    /// Parse a tagged wire form back into a chunk.
    ///
    /// Returns `None` for unknown tags or malformed framing. Used by clients
    /// and tests; the controller never parses payloads it relays.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix('<')?;
        let close = rest.find('>')?;
        let tag = &rest[..close];
        let kind = ChunkKind::from_tag(tag)?;
        let body = &rest[close + 1..];
        let payload = body.strip_suffix(&format!("</{tag}>"))?;
        Some(Self {
            kind,
            payload: payload.to_string(),
        })
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Error,
    Timeout,
}

/// The JSON body of the terminal `<result>` chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecStatus,
    /// Wall-clock seconds, rounded to 4 decimals.
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
}

impl ExecutionResult {
    /// A successful execution, optionally carrying a serialized return value.
    pub fn success(elapsed_secs: f64, return_value: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            status: ExecStatus::Success,
            execution_time: round4(elapsed_secs),
            error_message: None,
            error_type: None,
            traceback: None,
            return_value,
        }
    }

    /// A failed execution with the interpreter's error details.
    pub fn failure(
        elapsed_secs: f64,
        error_type: String,
        error_message: String,
        traceback: Option<String>,
    ) -> Self {
        Self {
            success: false,
            status: ExecStatus::Error,
            execution_time: round4(elapsed_secs),
            error_message: Some(error_message),
            error_type: Some(error_type),
            traceback,
            return_value: None,
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of this shape cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn round4(secs: f64) -> f64 {
    (secs.max(0.0) * 10_000.0).round() / 10_000.0
}

/// Body of `POST /exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_var: Option<String>,
}

/// Body of the `POST /reset` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub success: bool,
    pub message: String,
}

/// Body of the `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub executor_ready: bool,
    pub execution_count: u64,
    pub variables_count: usize,
}

/// Body of the `GET /variables` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariablesResponse {
    pub count: usize,
    pub variables: Vec<String>,
}

/// Frame one event payload as SSE.
///
/// Payloads may contain newlines (interpreter output often does); each line
/// becomes its own `data:` field and the event ends with a blank line, so
/// [`SseEventBuffer`] reassembles the payload byte-for-byte.
pub fn frame_sse_event(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 16);
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Incrementally reassembles SSE events from raw byte chunks.
///
/// Network reads can split or merge lines arbitrarily; the controller feeds
/// whatever it received and drains complete event payloads. Consecutive
/// `data:` fields of one event are rejoined with `\n`, non-data fields are
/// ignored.
#[derive(Debug, Default)]
pub struct SseEventBuffer {
    buf: String,
    data_lines: Vec<String>,
}

impl SseEventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning the payloads of any events completed by
    /// this read, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    out.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(payload) = line.strip_prefix("data: ") {
                self.data_lines.push(payload.to_string());
            } else if line == "data:" {
                self.data_lines.push(String::new());
            }
            // Anything else (comments, other fields) is ignored.
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sse_round_trip() {
        let chunk = OutputChunk::text("hello\nworld");
        let wire = chunk.to_sse();
        assert_eq!(wire, "<txt>hello\nworld</txt>");
        assert_eq!(OutputChunk::parse(&wire), Some(chunk));
    }

    #[test]
    fn chunk_parse_rejects_unknown_tags() {
        assert_eq!(OutputChunk::parse("<frame>x</frame>"), None);
        assert_eq!(OutputChunk::parse("not a chunk"), None);
        assert_eq!(OutputChunk::parse("<txt>unterminated"), None);
    }

    #[test]
    fn result_chunk_is_valid_json() {
        let result = ExecutionResult::success(1.23456789, None);
        let chunk = OutputChunk::result(result.to_json());
        let parsed = OutputChunk::parse(&chunk.to_sse()).unwrap();
        assert_eq!(parsed.kind, ChunkKind::Result);

        let decoded: ExecutionResult = serde_json::from_str(&parsed.payload).unwrap();
        assert!(decoded.success);
        assert_eq!(decoded.status, ExecStatus::Success);
        assert_eq!(decoded.execution_time, 1.2346);
    }

    #[test]
    fn failure_result_carries_error_fields() {
        let result = ExecutionResult::failure(
            0.5,
            "ValueError".to_string(),
            "boom".to_string(),
            Some("Traceback (most recent call last):\n...".to_string()),
        );
        let json: serde_json::Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["status"], "error");
        assert_eq!(json["error_type"], "ValueError");
        assert_eq!(json["error_message"], "boom");
        assert!(json.get("return_value").is_none());
    }

    #[test]
    fn success_result_omits_error_fields() {
        let json: serde_json::Value =
            serde_json::from_str(&ExecutionResult::success(0.0, None).to_json()).unwrap();
        assert!(json.get("error_message").is_none());
        assert!(json.get("error_type").is_none());
        assert!(json.get("traceback").is_none());
    }

    #[test]
    fn sse_buffer_handles_split_reads() {
        let mut buf = SseEventBuffer::new();
        assert!(buf.feed(b"data: <txt>par").is_empty());
        let events = buf.feed(b"tial</txt>\n\ndata: <result>{}</result>\n\n");
        assert_eq!(events, vec!["<txt>partial</txt>", "<result>{}</result>"]);
    }

    #[test]
    fn sse_buffer_ignores_non_data_lines() {
        let mut buf = SseEventBuffer::new();
        let events = buf.feed(b": comment\nretry: 100\ndata: <txt>x</txt>\n\n");
        assert_eq!(events, vec!["<txt>x</txt>"]);
    }

    #[test]
    fn sse_framing_round_trips_multiline_payloads() {
        let payload = "<txt>line one\nline two\n</txt>";
        let framed = frame_sse_event(payload);
        assert_eq!(
            framed,
            "data: <txt>line one\ndata: line two\ndata: </txt>\n\n"
        );

        let mut buf = SseEventBuffer::new();
        let events = buf.feed(framed.as_bytes());
        assert_eq!(events, vec![payload.to_string()]);
    }

    #[test]
    fn sse_framing_round_trips_simple_payloads() {
        let mut buf = SseEventBuffer::new();
        let events = buf.feed(frame_sse_event("<txt>plain</txt>").as_bytes());
        assert_eq!(events, vec!["<txt>plain</txt>"]);
    }
}
