use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::permission::PermissionHandler;
use crate::stream::{start_session, SessionRequest, SessionStream};
use crate::types::{Message, Usage};
use crate::{Result, SessionError};

// ─── RunResult ────────────────────────────────────────────────────────────

/// Summary of a session that reached its result message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub session_id: Option<String>,
    /// The final text the agent produced (empty for error subtypes).
    pub result_text: String,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    pub usage: Usage,
    /// `true` if the result carried an error subtype (max turns, budget, …).
    pub is_error: bool,
    /// Messages delivered, the result included.
    pub message_count: usize,
}

// ─── Public API ───────────────────────────────────────────────────────────

/// Drive one session to completion and summarize its result.
///
/// Any session error is returned as-is; an error *result* (the agent gave up)
/// is an `Ok` with `is_error` set.
///
/// ```rust,ignore
/// use claude_session::{run, AllowAll, SessionRequest};
///
/// let result = run(SessionRequest::new("say hello"), Arc::new(AllowAll), CancellationToken::new()).await?;
/// println!("{}", result.result_text);
/// ```
pub async fn run(
    request: SessionRequest,
    handler: Arc<dyn PermissionHandler>,
    cancel: CancellationToken,
) -> Result<RunResult> {
    collect(start_session(request, handler, cancel).await?).await
}

/// Consume a [`SessionStream`] and extract the [`RunResult`].
///
/// Exposed as `pub(crate)` so tests can inject pre-built streams.
pub(crate) async fn collect(mut stream: SessionStream) -> Result<RunResult> {
    let mut session_id: Option<String> = None;
    let mut message_count = 0;

    while let Some(msg) = stream.next().await {
        let msg = msg?;
        message_count += 1;
        if session_id.is_none() {
            session_id = msg.session_id().map(str::to_owned);
        }
        if let Message::Result(r) = msg {
            return Ok(RunResult {
                session_id: r.session_id.or(session_id),
                result_text: r.result.unwrap_or_default(),
                total_cost_usd: r.cost_usd.unwrap_or(0.0),
                num_turns: r.num_turns.unwrap_or(0),
                usage: r.usage,
                is_error: r.is_error,
                message_count,
            });
        }
    }

    Err(SessionError::Incomplete)
}

// ─── Tests ────────────────────────────────────────────────────────────────
