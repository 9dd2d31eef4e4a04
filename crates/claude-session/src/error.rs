use std::path::PathBuf;

use thiserror::Error;

/// Every way a session can fail.
///
/// All variants are fatal to the session that raised them; nothing in this
/// crate retries.
#[derive(Debug, Error)]
pub enum SessionError {
    // ── Startup / connection ──────────────────────────────────────────────
    #[error("Claude CLI not found; searched: {}", format_paths(.searched))]
    CliNotFound { searched: Vec<PathBuf> },

    #[error("Failed to connect to Claude CLI: {message}")]
    CliConnection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // ── Protocol ──────────────────────────────────────────────────────────
    #[error("Failed to decode stream-json line: {source}\n  line: {line}")]
    JsonDecode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Claude CLI exited without a result message")]
    Incomplete,

    // ── Process exit ──────────────────────────────────────────────────────
    #[error("{}", format_process_exit(.exit_code, .stderr))]
    Process {
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        stderr: String,
    },

    // ── Policy ────────────────────────────────────────────────────────────
    #[error("Tool '{tool_name}' ({tool_use_id}) denied: {deny_reason}")]
    ToolDenied {
        tool_name: String,
        tool_use_id: String,
        deny_reason: String,
    },

    #[error("Permission decision for tool '{tool_name}' ({tool_use_id}) timed out after {timeout_ms}ms")]
    ToolPermissionTimeout {
        tool_name: String,
        tool_use_id: String,
        timeout_ms: u64,
    },

    #[error("Session cancelled")]
    Cancelled,

    // ── Scenario registry ─────────────────────────────────────────────────
    #[error("Unknown scenario: {0}")]
    ScenarioNotFound(String),

    #[error("Invalid scenario pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// `true` for the kinds that end a session in the `Aborted` state rather
    /// than `Failed`.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            SessionError::ToolDenied { .. }
                | SessionError::ToolPermissionTimeout { .. }
                | SessionError::Cancelled
        )
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_process_exit(exit_code: &Option<i32>, stderr: &str) -> String {
    let head = match exit_code {
        Some(code) => format!("Claude CLI process exited with code {code}"),
        None => "Claude CLI process terminated by signal".to_string(),
    };
    if stderr.is_empty() {
        head
    } else {
        format!("{head}\nstderr: {stderr}")
    }
}
