use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

// ─── Outer Message enum ───────────────────────────────────────────────────

/// One typed message delivered by a session, in transport arrival order.
///
/// Serialized form is tagged by `"type"` so a host can write a transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Session metadata. At most once, and first when present.
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    /// Terminal message. At most once, and last when present.
    Result(ResultMessage),
    /// Partial/incremental payloads the host may ignore.
    StreamEvent(StreamEvent),
}

impl Message {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::System(m) => m.session_id.as_deref(),
            Message::Assistant(m) => m.session_id.as_deref(),
            Message::User(m) => m.session_id.as_deref(),
            Message::Result(m) => m.session_id.as_deref(),
            Message::StreamEvent(_) => None,
        }
    }

    /// Returns `Some(&ResultMessage)` if this is the terminal result message.
    pub fn as_result(&self) -> Option<&ResultMessage> {
        if let Message::Result(r) = self {
            Some(r)
        } else {
            None
        }
    }

    /// Short discriminant used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::System(_) => "system",
            Message::Assistant(_) => "assistant",
            Message::User(_) => "user",
            Message::Result(_) => "result",
            Message::StreamEvent(_) => "stream_event",
        }
    }

    /// Content blocks of an assistant or user message; empty otherwise.
    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Message::Assistant(m) => &m.content,
            Message::User(m) => &m.content,
            _ => &[],
        }
    }
}

// ─── Content blocks ───────────────────────────────────────────────────────

/// Content blocks within an assistant or user message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Tool inputs are schema-polymorphic (owned by the tool), so Value is correct here.
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }
}

/// Concatenation of every `Text` block, in order.
fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

// ─── Assistant / user ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AssistantMessage {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    pub fn text(&self) -> String {
        joined_text(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl UserMessage {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    pub fn text(&self) -> String {
        joined_text(&self.content)
    }
}

// ─── System ───────────────────────────────────────────────────────────────

/// `type = "system"`, `subtype = "init"`: the session's opening metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SystemMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<McpServerStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
}

// ─── Result ───────────────────────────────────────────────────────────────

/// `type = "result"`: the terminal message of a well-formed session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMessage {
    /// `success`, `error_max_turns`, `error_during_execution`, …
    pub subtype: String,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    pub is_error: bool,
    /// Final result text. Absent for error subtypes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ResultMessage {
    /// A `success` result with only usage populated.
    pub fn success(usage: Usage) -> Self {
        Self {
            subtype: "success".into(),
            usage,
            session_id: None,
            cost_usd: None,
            duration_ms: None,
            num_turns: None,
            is_error: false,
            result: None,
        }
    }

    pub fn result_text(&self) -> Option<&str> {
        self.result.as_deref()
    }
}

/// Token accounting. `total_tokens` is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ─── Stream events ────────────────────────────────────────────────────────

/// Partial or ancillary update (`stream_event`, `tool_progress`, non-init
/// `system` subtypes, …). `data` is the raw record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub event_type: String,
    pub data: serde_json::Value,
}

// ─── QueryOptions ─────────────────────────────────────────────────────────

/// Options for launching the Claude CLI subprocess.
///
/// The scripted transport ignores these.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Claude model name (e.g. `"claude-sonnet-4-6"`)
    pub model: Option<String>,
    /// Maximum number of agentic turns before stopping with `error_max_turns`
    pub max_turns: Option<u32>,
    /// Maximum budget in USD before stopping with `error_max_budget_usd`
    pub max_budget_usd: Option<f64>,
    /// Tool names that are auto-approved by the CLI itself
    pub allowed_tools: Vec<String>,
    /// Tool names that are explicitly disallowed
    pub disallowed_tools: Vec<String>,
    /// Permission mode for tool execution
    pub permission_mode: PermissionMode,
    /// Override system prompt
    pub system_prompt: Option<String>,
    /// Text to append to the default system prompt
    pub append_system_prompt: Option<String>,
    /// Session ID to resume (loads conversation history)
    pub resume: Option<String>,
    /// Session ID for a specific conversation
    pub session_id: Option<String>,
    /// MCP servers to register for this session
    pub mcp_servers: Vec<McpServerConfig>,
    /// Working directory for the subprocess (default: current dir)
    pub cwd: Option<PathBuf>,
    /// Additional environment variables for the subprocess
    pub env: HashMap<String, String>,
    /// Additional working directories (`--add-dir`)
    pub additional_directories: Vec<String>,
    /// Explicit executable locations, checked in order. Empty means the
    /// default search list.
    pub executable_paths: Vec<PathBuf>,
    /// Whether stdin stays open after the initial prompt.
    pub input_mode: InputMode,
    /// Include partial/streaming messages (`--include-partial-messages`)
    pub include_partial_messages: bool,
}

/// How the initial prompt is written to the subprocess.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputMode {
    /// Stdin stays open; permission prompts are answered over the control
    /// protocol.
    #[default]
    Streaming,
    /// Stdin is closed after the prompt; the CLI's own permission mode
    /// governs execution.
    SingleShot,
}

/// Permission mode. Controls how the CLI itself authorizes tool executions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PermissionMode {
    /// Standard: prompts for dangerous operations
    #[default]
    Default,
    /// Auto-accept file edit operations
    AcceptEdits,
    /// Bypass all permission checks
    BypassPermissions,
    /// Planning mode, no actual tool execution
    Plan,
    /// Don't prompt; deny if not pre-approved
    DontAsk,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
            PermissionMode::DontAsk => "dontAsk",
        }
    }
}

/// MCP server configuration for stdio transport.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Logical name for this server (used in tool names as `mcp__<name>__<tool>`)
    pub name: String,
    /// Executable to spawn
    pub command: String,
    /// Arguments for the executable
    pub args: Vec<String>,
    /// Additional environment variables for the server process
    pub env: HashMap<String, String>,
}
