//! Agent event stream taxonomy (spec §4.5 output contract).
//!
//! Carried over near-verbatim from the donor's `stream/mod.rs`, which
//! already models the same assistant-text / tool-use / result shape
//! the external agent runtime emits as newline-delimited JSON.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Assistant { message: AssistantMessage, session_id: Option<String> },
    User { tool_use_result: Option<ToolUseResult> },
    Result { subtype: Option<String>, result: Option<String>, is_error: bool, total_cost_usd: Option<f64> },
    System { subtype: Option<String> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    ToolUse { name: String, input: serde_json::Value, id: String },
    Text { text: String },
    Thinking { thinking: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolUseResult {
    pub file: Option<FileInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub file_path: String,
}

/// An event normalized for the orchestrator's own consumption, the
/// adapter's output contract per spec §4.5.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart { name: String, id: String },
    ToolCallResult { id: String },
    Final { cost_usd: f64, success: bool },
}

pub fn describe_tool_use(name: &str, input: &serde_json::Value) -> String {
    match name {
        "Read" => format!("Read {}", input.get("file_path").and_then(|v| v.as_str()).unwrap_or("?")),
        "Write" => format!("Write {}", input.get("file_path").and_then(|v| v.as_str()).unwrap_or("?")),
        "Edit" => format!("Edit {}", input.get("file_path").and_then(|v| v.as_str()).unwrap_or("?")),
        "Bash" => format!("Bash: {}", input.get("command").and_then(|v| v.as_str()).unwrap_or("?")),
        "Glob" => format!("Glob {}", input.get("pattern").and_then(|v| v.as_str()).unwrap_or("?")),
        "Grep" => format!("Grep {}", input.get("pattern").and_then(|v| v.as_str()).unwrap_or("?")),
        other => other.to_string(),
    }
}

/// Parses one line of the agent's stdout. Malformed/unrecognized lines
/// are ignored rather than failing the iteration — only an absent
/// completion marker at the end fails it.
pub fn parse_stream_line(line: &str) -> Option<AgentEvent> {
    let event: StreamEvent = serde_json::from_str(line).ok()?;
    Some(match event {
        StreamEvent::Assistant { message, .. } => {
            let mut text = String::new();
            let mut thinking = String::new();
            let mut tool: Option<(String, String)> = None;
            for block in message.content {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(&t),
                    ContentBlock::Thinking { thinking: t } => thinking.push_str(&t),
                    ContentBlock::ToolUse { name, id, .. } => tool = Some((name, id)),
                }
            }
            if let Some((name, id)) = tool {
                AgentEvent::ToolCallStart { name, id }
            } else if !thinking.is_empty() {
                AgentEvent::ThinkingDelta(thinking)
            } else {
                AgentEvent::TextDelta(text)
            }
        }
        StreamEvent::User { tool_use_result } => AgentEvent::ToolCallResult {
            id: tool_use_result.and_then(|r| r.file).map(|f| f.file_path).unwrap_or_default(),
        },
        StreamEvent::Result { result, is_error, total_cost_usd, .. } => AgentEvent::Final {
            cost_usd: total_cost_usd.unwrap_or(0.0),
            success: !is_error && result.is_some(),
        },
        StreamEvent::System { .. } => return None,
    })
}
