//! Line-JSON stream decoding for the claude CLI.
//!
//! The CLI emits one JSON object per newline-terminated line. This module
//! turns raw stdout chunks into typed [`StreamSegment`]s: a framing layer
//! that tolerates lines split across reads, and a stateless per-line mapping
//! from the known event shapes. Malformed lines and unknown shapes produce
//! zero segments; they never fail the stream.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One typed event parsed from the subprocess output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamSegment {
    /// A chunk of assistant-visible prose.
    Text { content: String },
    /// An assistant internal reflection block.
    Thinking { content: String },
    /// The model is invoking a named tool with structured input.
    ToolUse { tool: String, input: Value },
    /// Observed tool output, optionally marked failed.
    ToolResult { content: String, is_error: bool },
    /// A subprocess system/status message.
    System { content: String },
    /// Terminal accounting record for a turn.
    Result {
        duration_ms: u64,
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Accumulates raw bytes and yields complete newline-terminated lines.
///
/// An incomplete trailing fragment is buffered until the next chunk or
/// [`LineBuffer::finish`], which flushes it as one final line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush any buffered fragment as a final line.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// Framing plus per-line decoding in one object, for callers that do not
/// interpose a post-processor between the two layers.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: LineBuffer,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, producing segments for each completed line.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<StreamSegment> {
        self.buffer
            .push_chunk(chunk)
            .iter()
            .flat_map(|line| decode_line(line))
            .collect()
    }

    /// Signal end-of-stream, decoding any buffered fragment.
    pub fn finish(&mut self) -> Vec<StreamSegment> {
        match self.buffer.finish() {
            Some(line) => decode_line(&line),
            None => Vec::new(),
        }
    }
}

/// Decode one line of subprocess output into zero or more segments.
///
/// The decoder is stateless across lines. Unknown `type` values and lines
/// that fail to parse are dropped silently.
pub fn decode_line(line: &str) -> Vec<StreamSegment> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            debug!("dropping unparseable stream line: {err}");
            return Vec::new();
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => decode_message_blocks(&value, false),
        Some("user") => decode_message_blocks(&value, true),
        Some("tool_result") => value
            .get("content")
            .map(|content| {
                vec![StreamSegment::ToolResult {
                    content: stringify(content),
                    is_error: value
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }]
            })
            .unwrap_or_default(),
        Some("system") => vec![decode_system(&value, trimmed)],
        Some("result") => vec![decode_result(&value)],
        Some(_) => Vec::new(),
        None => match value.get("output") {
            Some(output) => vec![StreamSegment::ToolResult {
                content: stringify(output),
                is_error: false,
            }],
            None => Vec::new(),
        },
    }
}

/// Walk `message.content` blocks. For user lines only `tool_result` blocks
/// are surfaced; the echoed user text is suppressed.
fn decode_message_blocks(value: &Value, tool_results_only: bool) -> Vec<StreamSegment> {
    let Some(blocks) = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut segments = Vec::new();
    for block in blocks {
        let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
        match block_type {
            "tool_result" => segments.push(StreamSegment::ToolResult {
                content: block.get("content").map(stringify).unwrap_or_default(),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            _ if tool_results_only => {}
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    segments.push(StreamSegment::Text {
                        content: text.to_string(),
                    });
                }
            }
            "thinking" => {
                if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                    segments.push(StreamSegment::Thinking {
                        content: thinking.to_string(),
                    });
                }
            }
            "tool_use" => segments.push(StreamSegment::ToolUse {
                tool: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => {}
        }
    }
    segments
}

fn decode_system(value: &Value, raw_line: &str) -> StreamSegment {
    let subtype = value.get("subtype").and_then(Value::as_str);
    let message = value.get("message").and_then(Value::as_str);
    let content = match (subtype, message) {
        (Some(subtype), Some(message)) => format!("{subtype}: {message}"),
        (Some(subtype), None) => subtype.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => raw_line.to_string(),
    };
    StreamSegment::System { content }
}

fn decode_result(value: &Value) -> StreamSegment {
    let usage = value.get("usage");
    let token = |key: &str| -> u64 {
        usage
            .and_then(|usage| usage.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    StreamSegment::Result {
        duration_ms: value
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        input_tokens: token("input_tokens"),
        output_tokens: token("output_tokens"),
    }
}

/// Tool-result content that is not already a string is serialized to JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
