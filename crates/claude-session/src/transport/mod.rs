//! Transports own the agent's side of a session: they produce raw records and
//! accept tool resolutions. The session controller is the only caller.

use async_trait::async_trait;

use crate::types::Message;
use crate::Result;

pub mod process;
pub mod scripted;

pub use process::{ProcessTransport, TeardownConfig};
pub use scripted::{
    builtin_scenarios, ResolutionLog, Scenario, ScenarioRegistry, ScenarioSummary, ScriptedTransport,
    DEFAULT_SCENARIO,
};

/// One unit of transport output.
#[derive(Debug, Clone)]
pub enum Record {
    /// A non-empty stdout line, not yet decoded.
    Line(String),
    /// A pre-built message (scripted replay).
    Message(Message),
}

/// A resolved permission decision, in the form the agent consumes it.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResolution {
    /// Execute the tool with `input` (the original or the host's replacement).
    Allow {
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    /// Do not execute; `message` becomes the tool's result.
    Deny {
        tool_use_id: String,
        tool_name: String,
        message: String,
    },
}

impl ToolResolution {
    pub fn tool_use_id(&self) -> &str {
        match self {
            ToolResolution::Allow { tool_use_id, .. } | ToolResolution::Deny { tool_use_id, .. } => {
                tool_use_id
            }
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            ToolResolution::Allow { tool_name, .. } | ToolResolution::Deny { tool_name, .. } => {
                tool_name
            }
        }
    }
}

/// The agent side of a session.
///
/// `next_record` must be cancel-safe: the controller races it against
/// permission decisions and cancellation, and a dropped call must not lose a
/// record.
#[async_trait]
pub trait Transport: Send {
    /// The next record, or `Ok(None)` once output has ended. Blocks until a
    /// record is available or the agent stops producing output.
    async fn next_record(&mut self) -> Result<Option<Record>>;

    /// Hand a resolved decision back to the agent. Never blocks on the agent.
    fn resolve_tool(&mut self, resolution: ToolResolution) -> Result<()>;

    /// The agent reported a result for `tool_use_id`, so the tool has run
    /// (or was refused) and no permission request for it will follow.
    fn tool_finished(&mut self, _tool_use_id: &str) {}

    /// Called once output has ended; surfaces a failed exit status.
    async fn finish(&mut self) -> Result<()>;

    /// Release the agent. Idempotent; called exactly once by the controller
    /// on every exit path.
    async fn shutdown(&mut self);
}
