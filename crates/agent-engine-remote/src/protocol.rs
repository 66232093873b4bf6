//! Agent engine wire protocol.

use agent_engine_core::{Fragment, RemoteError, SessionSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const CREATE_SESSION: &str = "async_create_session";
pub const GET_SESSION: &str = "async_get_session";
pub const STREAM_QUERY: &str = "async_stream_query";

/// Body of `:query` and `:streamQuery` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub class_method: String,
    pub input: Value,
}

impl QueryRequest {
    #[must_use]
    pub fn create_session(user_id: &str) -> Self {
        Self {
            class_method: CREATE_SESSION.to_string(),
            input: json!({ "user_id": user_id }),
        }
    }

    #[must_use]
    pub fn get_session(session_id: &str, user_id: &str) -> Self {
        Self {
            class_method: GET_SESSION.to_string(),
            input: json!({ "session_id": session_id, "user_id": user_id }),
        }
    }

    #[must_use]
    pub fn stream_query(user_id: &str, session_id: &str, message: &str) -> Self {
        Self {
            class_method: STREAM_QUERY.to_string(),
            input: json!({ "user_id": user_id, "session_id": session_id, "message": message }),
        }
    }
}

/// Response of a unary `:query` call.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub output: Value,
}

impl QueryResponse {
    /// Interpret the output as a session document.
    ///
    /// # Errors
    /// Returns [`RemoteError::Protocol`] if the output is not a session.
    pub fn into_snapshot(self) -> Result<SessionSnapshot, RemoteError> {
        if !self.output.is_object() {
            return Err(RemoteError::Protocol(format!(
                "expected a session object, got {}",
                self.output
            )));
        }
        SessionSnapshot::from_document(self.output)
    }
}

/// Resource description returned by `GET {resource}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResource {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// SSE fields other than `data` carry no reply content.
const SSE_CONTROL_FIELDS: [&str; 3] = ["event:", "id:", "retry:"];

/// Decode one line of a stream body.
///
/// Blank lines, SSE comments and SSE control fields yield nothing. An SSE
/// `data:` prefix is stripped. JSON payloads are decoded into fragments; any
/// other payload is plain text.
#[must_use]
pub fn decode_line(line: &str) -> Option<Fragment> {
    let line = line.trim_end_matches('\r');
    if line.starts_with(':') || SSE_CONTROL_FIELDS.iter().any(|f| line.starts_with(f)) {
        return None;
    }
    let payload = line
        .strip_prefix("data:")
        .map_or(line, |data| data.strip_prefix(' ').unwrap_or(data));
    if payload.trim().is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => Some(Fragment::from_value(value)),
        Err(_) => Some(Fragment::RawText(payload.to_string())),
    }
}

/// Splits a chunked byte stream into lines.
///
/// Works on bytes so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    scanned: usize,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// Take whatever is left after the final chunk.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
