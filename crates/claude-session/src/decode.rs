//! Stream-json record decoder.
//!
//! Turns one raw record into exactly one [`Message`], or fails. Decoding is
//! pure: no state is carried between calls. Structural problems surface as
//! [`SessionError::JsonDecode`] with the offending text attached; a
//! well-formed record of an unknown `type` is a [`SessionError::Protocol`].

use serde::de::Error as _;
use serde::Deserialize;
use serde_json::Value;

use crate::types::{
    AssistantMessage, ContentBlock, McpServerStatus, Message, ResultMessage, StreamEvent,
    SystemMessage, Usage, UserMessage,
};
use crate::{Result, SessionError};

/// Record types the CLI emits alongside the conversation. They carry no
/// conversation state and are surfaced as [`StreamEvent`]s.
const ANCILLARY_TYPES: &[&str] = &[
    "stream_event",
    "tool_progress",
    "tool_use_summary",
    "auth_status",
    "rate_limit_event",
];

/// Parse one JSONL line and decode it.
pub fn decode_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line).map_err(|source| SessionError::JsonDecode {
        line: line.to_owned(),
        source,
    })?;
    decode_record(raw).map_err(|e| match e {
        // Prefer the exact text the transport produced over a re-serialization.
        SessionError::JsonDecode { source, .. } => SessionError::JsonDecode {
            line: line.to_owned(),
            source,
        },
        other => other,
    })
}

/// Decode an already-parsed record.
pub fn decode_record(raw: Value) -> Result<Message> {
    let text = raw.to_string();
    let fail = |source: serde_json::Error| SessionError::JsonDecode {
        line: text.clone(),
        source,
    };

    let msg_type = match raw.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => return Err(fail(serde_json::Error::custom("`type` must be a string"))),
        None => return Err(fail(serde_json::Error::missing_field("type"))),
    };

    match msg_type.as_str() {
        "system" => decode_system(raw).map_err(fail),
        "assistant" => decode_assistant(raw).map_err(fail),
        "user" => decode_user(raw).map_err(fail),
        "result" => decode_result(raw).map_err(fail),
        t if ANCILLARY_TYPES.contains(&t) => Ok(decode_ancillary(t, raw)),
        other => Err(SessionError::Protocol(format!(
            "unrecognized message type: {other}"
        ))),
    }
}

// ─── Wire shapes ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireSystem {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    mcp_servers: Option<Vec<WireMcpServer>>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
}

#[derive(Deserialize)]
struct WireMcpServer {
    name: String,
    status: String,
}

#[derive(Deserialize)]
struct WireConversation {
    message: WireBody,
    #[serde(default)]
    parent_tool_use_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct WireBody {
    content: Value,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
    },
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default = "default_subtype")]
    subtype: String,
    #[serde(default)]
    usage: WireUsage,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default, alias = "total_cost_usd")]
    cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
}

fn default_subtype() -> String {
    "success".to_string()
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

// ─── Per-type decoders ────────────────────────────────────────────────────

fn decode_system(raw: Value) -> serde_json::Result<Message> {
    let subtype = raw
        .get("subtype")
        .and_then(Value::as_str)
        .map(str::to_owned);

    // Only `init` is session metadata; later system records (status,
    // compaction, task progress) are incremental updates.
    if let Some(sub) = subtype.filter(|s| s != "init") {
        return Ok(Message::StreamEvent(StreamEvent {
            event_type: format!("system/{sub}"),
            data: raw,
        }));
    }

    let wire: WireSystem = serde_json::from_value(raw)?;
    Ok(Message::System(SystemMessage {
        session_id: wire.session_id,
        mcp_servers: wire.mcp_servers.map(|servers| {
            servers
                .into_iter()
                .map(|s| McpServerStatus {
                    name: s.name,
                    status: s.status,
                })
                .collect()
        }),
        model: wire.model,
        cwd: wire.cwd,
        tools: wire.tools,
    }))
}

fn decode_assistant(raw: Value) -> serde_json::Result<Message> {
    let wire: WireConversation = serde_json::from_value(raw)?;
    Ok(Message::Assistant(AssistantMessage {
        content: decode_blocks(wire.message.content)?,
        model: wire.message.model,
        stop_reason: wire.message.stop_reason,
        parent_tool_use_id: wire.parent_tool_use_id,
        session_id: wire.session_id,
    }))
}

fn decode_user(raw: Value) -> serde_json::Result<Message> {
    let wire: WireConversation = serde_json::from_value(raw)?;
    Ok(Message::User(UserMessage {
        content: decode_blocks(wire.message.content)?,
        parent_tool_use_id: wire.parent_tool_use_id,
        session_id: wire.session_id,
    }))
}

fn decode_result(raw: Value) -> serde_json::Result<Message> {
    let wire: WireResult = serde_json::from_value(raw)?;
    Ok(Message::Result(ResultMessage {
        subtype: wire.subtype,
        usage: Usage {
            input_tokens: wire.usage.input_tokens,
            output_tokens: wire.usage.output_tokens,
            cache_read_input_tokens: wire.usage.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: wire.usage.cache_creation_input_tokens.unwrap_or(0),
        },
        session_id: wire.session_id,
        cost_usd: wire.cost_usd,
        duration_ms: wire.duration_ms,
        num_turns: wire.num_turns,
        is_error: wire.is_error,
        result: wire.result,
    }))
}

fn decode_ancillary(msg_type: &str, raw: Value) -> Message {
    if msg_type == "stream_event" {
        if let Some(event) = raw.get("event") {
            let event_type = event
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or(msg_type)
                .to_owned();
            return Message::StreamEvent(StreamEvent {
                event_type,
                data: event.clone(),
            });
        }
    }
    Message::StreamEvent(StreamEvent {
        event_type: msg_type.to_owned(),
        data: raw,
    })
}

/// `content` is either a bare string (one text block) or a list of blocks.
fn decode_blocks(content: Value) -> serde_json::Result<Vec<ContentBlock>> {
    let wire: Vec<WireBlock> = match content {
        Value::String(text) => return Ok(vec![ContentBlock::Text { text }]),
        Value::Array(_) => serde_json::from_value(content)?,
        other => {
            return Err(serde_json::Error::custom(format!(
                "`content` must be a string or an array, got {other}"
            )))
        }
    };

    wire.into_iter()
        .map(|block| {
            Ok(match block {
                WireBlock::Text { text } => ContentBlock::Text { text },
                WireBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
                WireBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => ContentBlock::ToolResult {
                    tool_use_id,
                    content: tool_result_text(&content)?,
                    is_error: is_error.unwrap_or(false),
                },
                WireBlock::Thinking { thinking } => ContentBlock::Thinking { thinking },
            })
        })
        .collect()
}

/// Tool result content is a string, a list of text blocks, or absent.
fn tool_result_text(content: &Value) -> serde_json::Result<String> {
    match content {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(items) => Ok(items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect()),
        other => Err(serde_json::Error::custom(format!(
            "tool_result `content` must be a string or an array, got {other}"
        ))),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
