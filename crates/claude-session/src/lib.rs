//! `claude-session` drives the Claude CLI as a long-lived, bidirectional
//! session.
//!
//! The crate speaks the `--output-format stream-json` protocol: it launches
//! the agent, decodes its output into a closed set of typed messages, and
//! puts every tool use the agent requests to a host-supplied
//! [`PermissionHandler`] before the agent's next turn is delivered.
//!
//! # Architecture
//!
//! ```text
//! SessionRequest
//!     │
//!     ▼
//! Transport        ← ProcessTransport: spawns `claude … --output-format stream-json`
//!     │               ScriptedTransport: replays a registered scenario
//!     ▼
//! decode           ← one JSONL record → one Message, or a typed error
//!     │
//!     ▼
//! Controller       ← ordering checks, permission mediation, single teardown path
//!     │
//!     ▼
//! SessionStream    ← futures::Stream<Item = Result<Message>>, capacity-1 channel
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use claude_session::{start_session, Message, SessionRequest, ToolPolicy};
//! use futures::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! let policy = ToolPolicy {
//!     allow: vec!["Read".into(), "Grep".into()],
//!     ..Default::default()
//! };
//! let mut stream = start_session(
//!     SessionRequest::new("Why does the build fail?"),
//!     Arc::new(policy),
//!     CancellationToken::new(),
//! )
//! .await?;
//! while let Some(msg) = stream.next().await {
//!     if let Message::Result(r) = msg? {
//!         println!("{}", r.result_text().unwrap_or(""));
//!     }
//! }
//! ```

pub mod decode;
pub mod discovery;
pub mod error;
pub mod permission;
pub mod runner;
pub mod stream;
pub mod transport;
pub mod types;


pub use error::SessionError;
pub use permission::{
    from_fn, AllowAll, Mediator, PermissionConfig, PermissionContext, PermissionDecision,
    PermissionHandler, ToolPolicy,
};
pub use runner::{run, RunResult};
pub use stream::{start_session, Backend, SessionRequest, SessionState, SessionStream};
pub use transport::{
    ProcessTransport, ResolutionLog, Scenario, ScenarioRegistry, ScenarioSummary,
    ScriptedTransport, TeardownConfig, ToolResolution, Transport, DEFAULT_SCENARIO,
};
pub use types::{
    AssistantMessage, ContentBlock, InputMode, McpServerConfig, McpServerStatus, Message,
    PermissionMode, QueryOptions, ResultMessage, StreamEvent, SystemMessage, Usage, UserMessage,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, SessionError>;
