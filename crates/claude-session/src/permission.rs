//! Tool-permission mediation.
//!
//! Every `ToolUse` block the agent emits is put to a host-supplied
//! [`PermissionHandler`] under a deadline. The [`Mediator`] turns the host's
//! [`PermissionDecision`] into either a [`ToolResolution`] for the agent or a
//! session-ending error.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::transport::ToolResolution;
use crate::{Result, SessionError};

/// The host's answer for one tool use.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Run the tool, with `updated_input` replacing the original input when
    /// present.
    Allow { updated_input: Option<Value> },
    /// Do not run the tool. With `interrupt` the whole session aborts;
    /// otherwise the agent sees `access denied: <message>` and carries on.
    Deny { message: String, interrupt: bool },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        PermissionDecision::Allow {
            updated_input: None,
        }
    }

    pub fn deny(message: impl Into<String>, interrupt: bool) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
            interrupt,
        }
    }
}

/// Read-only snapshot handed to the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionContext {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: Value,
    pub working_directory: Option<PathBuf>,
    pub session_id: Option<String>,
}

/// Decides whether a tool use may run.
///
/// `cancel` fires when the session is cancelled or the decision deadline
/// passes; long-running handlers (a human approval prompt, say) should stop
/// waiting when it does.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn decide(&self, ctx: PermissionContext, cancel: CancellationToken) -> PermissionDecision;
}

/// Approves everything unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionHandler for AllowAll {
    async fn decide(&self, _ctx: PermissionContext, _cancel: CancellationToken) -> PermissionDecision {
        PermissionDecision::allow()
    }
}

/// Adapter for an async closure. See [`from_fn`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a [`PermissionHandler`].
///
/// ```rust,ignore
/// let handler = claude_session::permission::from_fn(|ctx, _cancel| async move {
///     if ctx.tool_name == "Bash" {
///         PermissionDecision::deny("no shell", false)
///     } else {
///         PermissionDecision::allow()
///     }
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(PermissionContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = PermissionDecision> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> PermissionHandler for FnHandler<F>
where
    F: Fn(PermissionContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = PermissionDecision> + Send,
{
    async fn decide(&self, ctx: PermissionContext, cancel: CancellationToken) -> PermissionDecision {
        (self.0)(ctx, cancel).await
    }
}

/// Static allow/deny lists by tool name.
///
/// A name ending in `*` matches by prefix (`mcp__board__*`). Deny entries win
/// over allow entries; tools on neither list fall to `default_allow`.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub default_allow: bool,
    pub interrupt_on_deny: bool,
}

impl ToolPolicy {
    fn listed(list: &[String], tool: &str) -> bool {
        list.iter().any(|entry| match entry.strip_suffix('*') {
            Some(prefix) => tool.starts_with(prefix),
            None => entry == tool,
        })
    }

    pub fn permits(&self, tool: &str) -> bool {
        if Self::listed(&self.deny, tool) {
            return false;
        }
        Self::listed(&self.allow, tool) || self.default_allow
    }
}

#[async_trait]
impl PermissionHandler for ToolPolicy {
    async fn decide(&self, ctx: PermissionContext, _cancel: CancellationToken) -> PermissionDecision {
        if self.permits(&ctx.tool_name) {
            PermissionDecision::allow()
        } else {
            PermissionDecision::deny(
                format!("tool '{}' is not permitted by policy", ctx.tool_name),
                self.interrupt_on_deny,
            )
        }
    }
}

// ─── Mediator ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PermissionConfig {
    /// Deadline for a single decision.
    pub timeout: Duration,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct Mediator {
    handler: Arc<dyn PermissionHandler>,
    config: PermissionConfig,
}

impl Mediator {
    pub fn new(handler: Arc<dyn PermissionHandler>, config: PermissionConfig) -> Self {
        Self { handler, config }
    }

    /// Ask the handler about one tool use.
    ///
    /// Errors end the session: [`SessionError::ToolDenied`] for an
    /// interrupting denial, [`SessionError::ToolPermissionTimeout`] when the
    /// deadline passes, [`SessionError::Cancelled`] when `cancel` fires first.
    pub async fn mediate(
        &self,
        ctx: PermissionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResolution> {
        let tool_name = ctx.tool_name.clone();
        let tool_use_id = ctx.tool_use_id.clone();
        let input = ctx.input.clone();
        tracing::debug!(tool = %tool_name, %tool_use_id, "requesting permission decision");

        let decision_cancel = cancel.child_token();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(
                self.config.timeout,
                self.handler.decide(ctx, decision_cancel.clone()),
            ) => Some(r),
        };
        // Release a handler that is still waiting.
        decision_cancel.cancel();

        let decision = match outcome {
            None => return Err(SessionError::Cancelled),
            Some(Err(_elapsed)) => {
                tracing::warn!(tool = %tool_name, %tool_use_id, "permission decision timed out");
                return Err(SessionError::ToolPermissionTimeout {
                    tool_name,
                    tool_use_id,
                    timeout_ms: self.config.timeout.as_millis() as u64,
                });
            }
            Some(Ok(decision)) => decision,
        };

        match decision {
            PermissionDecision::Allow { updated_input } => {
                tracing::debug!(
                    tool = %tool_name,
                    %tool_use_id,
                    replaced_input = updated_input.is_some(),
                    "tool allowed"
                );
                Ok(ToolResolution::Allow {
                    tool_use_id,
                    tool_name,
                    input: updated_input.unwrap_or(input),
                })
            }
            PermissionDecision::Deny {
                message,
                interrupt: false,
            } => {
                tracing::debug!(tool = %tool_name, %tool_use_id, %message, "tool denied");
                Ok(ToolResolution::Deny {
                    tool_use_id,
                    tool_name,
                    message: format!("access denied: {message}"),
                })
            }
            PermissionDecision::Deny {
                message,
                interrupt: true,
            } => {
                tracing::info!(tool = %tool_name, %tool_use_id, %message, "tool denied; aborting session");
                Err(SessionError::ToolDenied {
                    tool_name,
                    tool_use_id,
                    deny_reason: message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tool: &str) -> PermissionContext {
        PermissionContext {
            tool_name: tool.into(),
            tool_use_id: "t1".into(),
            input: json!({"path": "a.txt"}),
            working_directory: None,
            session_id: None,
        }
    }

    fn mediator(handler: impl PermissionHandler + 'static, timeout_ms: u64) -> Mediator {
        Mediator::new(
            Arc::new(handler),
            PermissionConfig {
                timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[tokio::test]
    async fn allow_keeps_original_input() {
        let m = mediator(AllowAll, 1000);
        let res = m.mediate(ctx("Read"), &CancellationToken::new()).await.unwrap();
        assert_eq!(
            res,
            ToolResolution::Allow {
                tool_use_id: "t1".into(),
                tool_name: "Read".into(),
                input: json!({"path": "a.txt"}),
            }
        );
    }

    #[tokio::test]
    async fn allow_substitutes_updated_input() {
        let m = mediator(
            from_fn(|_ctx, _cancel| async {
                PermissionDecision::Allow {
                    updated_input: Some(json!({"path": "sandbox/a.txt"})),
                }
            }),
            1000,
        );
        let res = m.mediate(ctx("Write"), &CancellationToken::new()).await.unwrap();
        let ToolResolution::Allow { input, .. } = res else {
            panic!("expected allow")
        };
        assert_eq!(input["path"], "sandbox/a.txt");
    }

    #[tokio::test]
    async fn deny_without_interrupt_becomes_access_denied() {
        let m = mediator(
            from_fn(|_ctx, _cancel| async { PermissionDecision::deny("read only", false) }),
            1000,
        );
        let res = m.mediate(ctx("Write"), &CancellationToken::new()).await.unwrap();
        let ToolResolution::Deny { message, .. } = res else {
            panic!("expected deny")
        };
        assert_eq!(message, "access denied: read only");
    }

    #[tokio::test]
    async fn deny_with_interrupt_is_an_error() {
        let m = mediator(
            from_fn(|_ctx, _cancel| async { PermissionDecision::deny("not allowed", true) }),
            1000,
        );
        let err = m.mediate(ctx("Write"), &CancellationToken::new()).await.unwrap_err();
        let SessionError::ToolDenied {
            tool_use_id,
            deny_reason,
            ..
        } = err
        else {
            panic!("expected ToolDenied, got {err:?}")
        };
        assert_eq!(tool_use_id, "t1");
        assert_eq!(deny_reason, "not allowed");
    }

    #[tokio::test]
    async fn pending_handler_times_out() {
        let m = mediator(
            from_fn(|_ctx, _cancel| std::future::pending::<PermissionDecision>()),
            50,
        );
        let started = std::time::Instant::now();
        let err = m.mediate(ctx("Bash"), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ToolPermissionTimeout { timeout_ms: 50, .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn handler_token_fires_after_timeout() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let m = mediator(
            from_fn(move |_ctx, cancel: CancellationToken| {
                let tx = tx.lock().unwrap().take();
                async move {
                    if let Some(tx) = tx {
                        let _ = tx.send(cancel);
                    }
                    std::future::pending::<PermissionDecision>().await
                }
            }),
            20,
        );
        let _ = m.mediate(ctx("Bash"), &CancellationToken::new()).await;
        let handler_token = rx.await.unwrap();
        assert!(handler_token.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_decision() {
        let m = mediator(
            from_fn(|_ctx, _cancel| std::future::pending::<PermissionDecision>()),
            60_000,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = m.mediate(ctx("Bash"), &cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }

    #[test]
    fn policy_deny_beats_allow_and_wildcards_match() {
        let policy = ToolPolicy {
            allow: vec!["Read".into(), "mcp__board__*".into(), "Bash".into()],
            deny: vec!["Bash".into()],
            default_allow: false,
            interrupt_on_deny: false,
        };
        assert!(policy.permits("Read"));
        assert!(policy.permits("mcp__board__list"));
        assert!(!policy.permits("Bash"));
        assert!(!policy.permits("Write"));
    }

    #[tokio::test]
    async fn policy_denial_carries_interrupt_flag() {
        let policy = ToolPolicy {
            deny: vec!["Bash".into()],
            default_allow: true,
            interrupt_on_deny: true,
            ..Default::default()
        };
        let decision = policy.decide(ctx("Bash"), CancellationToken::new()).await;
        assert!(matches!(
            decision,
            PermissionDecision::Deny {
                interrupt: true,
                ..
            }
        ));
        assert_eq!(
            policy.decide(ctx("Write"), CancellationToken::new()).await,
            PermissionDecision::allow()
        );
    }
}
