use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::stream::FusedStream;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::decode::decode_line;
use crate::permission::{Mediator, PermissionConfig, PermissionContext, PermissionHandler};
use crate::transport::{
    ProcessTransport, Record, ScenarioRegistry, ScriptedTransport, TeardownConfig, ToolResolution,
    Transport,
};
use crate::types::{ContentBlock, Message, QueryOptions};
use crate::{Result, SessionError};

// ─── Request ──────────────────────────────────────────────────────────────

/// Where a session's messages come from.
#[derive(Debug, Clone, Default)]
pub enum Backend {
    /// Spawn the Claude CLI.
    #[default]
    Process,
    /// Replay the scenario the registry resolves for the prompt.
    Scripted(ScenarioRegistry),
}

/// Everything needed to open one session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub prompt: String,
    pub options: QueryOptions,
    pub backend: Backend,
    pub permission: PermissionConfig,
    pub teardown: TeardownConfig,
}

impl SessionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn scripted(prompt: impl Into<String>, registry: ScenarioRegistry) -> Self {
        Self {
            prompt: prompt.into(),
            backend: Backend::Scripted(registry),
            ..Default::default()
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_permission(mut self, permission: PermissionConfig) -> Self {
        self.permission = permission;
        self
    }
}

/// Controller lifecycle. `Completed`, `Aborted` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Streaming,
    /// The result message was delivered and the agent released.
    Completed,
    /// Interrupting denial, permission timeout, or cancellation.
    Aborted,
    /// Decode, protocol, exit-status, or connection failure.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed
        )
    }
}

// ─── Entry point ──────────────────────────────────────────────────────────

/// Open a session and return its message stream.
///
/// Startup failures ([`SessionError::CliNotFound`],
/// [`SessionError::CliConnection`], an unresolvable scenario) are returned
/// here, before any message exists. Everything after that arrives through
/// the stream.
///
/// `cancel` aborts the session at any point; dropping the stream does the
/// same.
///
/// ```rust,ignore
/// use claude_session::{start_session, AllowAll, SessionRequest};
/// use futures::StreamExt;
///
/// let mut stream = start_session(
///     SessionRequest::new("fix the failing test"),
///     Arc::new(AllowAll),
///     CancellationToken::new(),
/// )
/// .await?;
/// while let Some(msg) = stream.next().await {
///     println!("{:?}", msg?);
/// }
/// ```
pub async fn start_session(
    request: SessionRequest,
    handler: Arc<dyn PermissionHandler>,
    cancel: CancellationToken,
) -> Result<SessionStream> {
    let transport: Box<dyn Transport> = match &request.backend {
        Backend::Scripted(registry) => Box::new(ScriptedTransport::start(registry, &request.prompt)?),
        Backend::Process => {
            let start = ProcessTransport::start(&request.prompt, &request.options, request.teardown);
            let transport = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                r = start => r?,
            };
            Box::new(transport)
        }
    };

    let mediator = Mediator::new(handler, request.permission);
    Ok(SessionStream::from_transport(
        transport,
        mediator,
        request.options.cwd.clone(),
        cancel,
    ))
}

// ─── SessionStream ────────────────────────────────────────────────────────

/// The single-pass message sequence of one session.
///
/// Backed by a capacity-1 channel: a background task owns the transport and
/// the controller, and never runs more than one message ahead of the
/// consumer. The stream ends after the `Result` message or the first error.
pub struct SessionStream {
    rx: mpsc::Receiver<Result<Message>>,
    state: watch::Receiver<SessionState>,
    done: bool,
    _cancel_on_drop: Option<DropGuard>,
}

impl SessionStream {
    /// Run a session over an already-started transport.
    pub fn from_transport(
        transport: Box<dyn Transport>,
        mediator: Mediator,
        working_directory: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (state_tx, state) = watch::channel(SessionState::Starting);
        let session_cancel = cancel.child_token();

        let controller = Controller {
            transport,
            mediator,
            cancel: session_cancel.clone(),
            tx,
            state: state_tx,
            working_directory,
            session_id: None,
            held: VecDeque::new(),
            eof: false,
            stalled: false,
            started: false,
            tool_ids: HashSet::new(),
        };
        tokio::spawn(controller.run());

        Self {
            rx,
            state,
            done: false,
            _cancel_on_drop: Some(session_cancel.drop_guard()),
        }
    }

    /// Test-only constructor: wrap a raw receiver as a `SessionStream`.
    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<Result<Message>>) -> Self {
        let (_tx, state) = watch::channel(SessionState::Streaming);
        Self {
            rx,
            state,
            done: false,
            _cancel_on_drop: None,
        }
    }

    /// Current controller state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the controller reaches a terminal state and has released
    /// the agent.
    pub async fn finished(&mut self) -> SessionState {
        if let Ok(state) = self.state.wait_for(|s| s.is_terminal()).await {
            return *state;
        }
        *self.state.borrow()
    }
}

impl Stream for SessionStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let item = ready!(self.rx.poll_recv(cx));
        match &item {
            Some(Ok(Message::Result(_))) | Some(Err(_)) | None => self.done = true,
            Some(Ok(_)) => {}
        }
        Poll::Ready(item)
    }
}

impl FusedStream for SessionStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

// ─── Controller ───────────────────────────────────────────────────────────

struct Controller {
    transport: Box<dyn Transport>,
    mediator: Mediator,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Message>>,
    state: watch::Sender<SessionState>,
    working_directory: Option<PathBuf>,
    session_id: Option<String>,
    /// Read ahead of delivery while a permission decision was pending.
    held: VecDeque<Result<Message>>,
    eof: bool,
    /// Set once read-ahead hit an error or the result; nothing more is read.
    stalled: bool,
    /// A non-stream-event message has been delivered.
    started: bool,
    tool_ids: HashSet<String>,
}

impl Controller {
    async fn run(mut self) {
        self.state.send_replace(SessionState::Streaming);
        let outcome = self.drive().await;

        // The one teardown path, taken on every outcome.
        self.transport.shutdown().await;

        match outcome {
            Ok(()) => {
                self.state.send_replace(SessionState::Completed);
                tracing::info!(session_id = ?self.session_id, "session completed");
            }
            Err(e) => {
                let state = if e.is_abort() {
                    SessionState::Aborted
                } else {
                    SessionState::Failed
                };
                self.state.send_replace(state);
                tracing::info!(session_id = ?self.session_id, ?state, error = %e, "session ended");
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let Some(msg) = self.next_message().await? else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                    r = self.transport.finish() => r?,
                }
                return Err(SessionError::Incomplete);
            };

            self.check_order(&msg)?;
            for block in msg.content() {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    self.transport.tool_finished(tool_use_id);
                }
            }
            if self.session_id.is_none() {
                self.session_id = msg.session_id().map(str::to_owned);
            }

            let requests: Vec<PermissionContext> = msg
                .content()
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => Some(PermissionContext {
                        tool_name: name.clone(),
                        tool_use_id: id.clone(),
                        input: input.clone(),
                        working_directory: self.working_directory.clone(),
                        session_id: self.session_id.clone(),
                    }),
                    _ => None,
                })
                .collect();
            let terminal = matches!(msg, Message::Result(_));

            self.deliver(msg).await?;
            if terminal {
                return Ok(());
            }

            // One decision in flight at a time, in block order.
            for ctx in requests {
                let resolution = self.await_decision(ctx).await?;
                self.transport.resolve_tool(resolution)?;
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<Message>> {
        if let Some(held) = self.held.pop_front() {
            return held.map(Some);
        }
        if self.eof {
            return Ok(None);
        }
        let record = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            r = self.transport.next_record() => r?,
        };
        match record {
            Some(record) => decode(record).map(Some),
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    /// Wait for the decision while continuing to drain the transport, so an
    /// agent that keeps writing never blocks on a full pipe.
    async fn await_decision(&mut self, ctx: PermissionContext) -> Result<ToolResolution> {
        let mediator = self.mediator.clone();
        let cancel = self.cancel.clone();
        let decision = async move { mediator.mediate(ctx, &cancel).await };
        tokio::pin!(decision);

        loop {
            let draining = !self.eof && !self.stalled;
            tokio::select! {
                biased;
                resolution = &mut decision => return resolution,
                record = self.transport.next_record(), if draining => match record {
                    Ok(Some(record)) => {
                        let msg = decode(record);
                        if matches!(msg, Err(_) | Ok(Message::Result(_))) {
                            self.stalled = true;
                        }
                        self.held.push_back(msg);
                    }
                    Ok(None) => self.eof = true,
                    Err(e) => {
                        self.stalled = true;
                        self.held.push_back(Err(e));
                    }
                },
            }
        }
    }

    async fn deliver(&mut self, msg: Message) -> Result<()> {
        tracing::debug!(kind = msg.kind(), "delivering message");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            r = self.tx.send(Ok(msg)) => r.map_err(|_| SessionError::Cancelled),
        }
    }

    fn check_order(&mut self, msg: &Message) -> Result<()> {
        match msg {
            Message::System(_) if self.started => {
                return Err(SessionError::Protocol(
                    "system message after the session started".into(),
                ));
            }
            Message::Assistant(_) | Message::User(_) => {
                for block in msg.content() {
                    match block {
                        ContentBlock::ToolUse { id, .. } => {
                            if !self.tool_ids.insert(id.clone()) {
                                return Err(SessionError::Protocol(format!(
                                    "duplicate tool_use id {id}"
                                )));
                            }
                        }
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            if !self.tool_ids.contains(tool_use_id) {
                                return Err(SessionError::Protocol(format!(
                                    "tool_result for unknown tool_use id {tool_use_id}"
                                )));
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        if !matches!(msg, Message::StreamEvent(_)) {
            self.started = true;
        }
        Ok(())
    }
}

fn decode(record: Record) -> Result<Message> {
    match record {
        Record::Line(line) => decode_line(&line),
        Record::Message(msg) => Ok(msg),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{from_fn, AllowAll, PermissionDecision};
    use crate::transport::Scenario;
    use crate::types::{AssistantMessage, ResultMessage, SystemMessage, Usage, UserMessage};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scripted(scenario: Scenario) -> (SessionStream, crate::transport::ResolutionLog) {
        scripted_with(scenario, Arc::new(AllowAll), PermissionConfig::default())
    }

    fn scripted_with(
        scenario: Scenario,
        handler: Arc<dyn PermissionHandler>,
        config: PermissionConfig,
    ) -> (SessionStream, crate::transport::ResolutionLog) {
        let transport = ScriptedTransport::new(Arc::new(scenario));
        let log = transport.resolutions();
        let stream = SessionStream::from_transport(
            Box::new(transport),
            Mediator::new(handler, config),
            None,
            CancellationToken::new(),
        );
        (stream, log)
    }

    fn builtin(id: &str) -> Scenario {
        ScenarioRegistry::new()
            .get(id)
            .map(|s| (*s).clone())
            .unwrap()
    }

    #[tokio::test]
    async fn quick_success_yields_two_messages() {
        let (mut stream, _) = scripted(builtin("quick-success"));
        let mut messages = Vec::new();
        while let Some(msg) = stream.next().await {
            messages.push(msg.unwrap());
        }
        assert_eq!(messages.len(), 2);
        let Message::Assistant(a) = &messages[0] else {
            panic!("expected assistant")
        };
        assert_eq!(a.text(), "done");
        let r = messages[1].as_result().unwrap();
        assert_eq!(r.usage.total_tokens(), 15);
        assert_eq!(stream.finished().await, SessionState::Completed);
    }

    #[tokio::test]
    async fn stream_is_fused_after_result() {
        let (mut stream, _) = scripted(builtin("quick-success"));
        while stream.next().await.is_some() {}
        assert!(stream.is_terminated());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn interrupting_denial_aborts_with_tool_denied() {
        let handler = Arc::new(from_fn(|ctx: PermissionContext, _cancel| async move {
            assert_eq!(ctx.tool_use_id, "t1");
            PermissionDecision::deny("not allowed", true)
        }));
        let (mut stream, log) =
            scripted_with(builtin("tool-use"), handler, PermissionConfig::default());

        let mut kinds = Vec::new();
        let mut error = None;
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(m) => kinds.push(m.kind()),
                Err(e) => error = Some(e),
            }
        }
        assert_eq!(kinds, ["system", "assistant"]);
        let Some(SessionError::ToolDenied {
            tool_use_id,
            deny_reason,
            ..
        }) = error
        else {
            panic!("expected ToolDenied, got {error:?}")
        };
        assert_eq!(tool_use_id, "t1");
        assert_eq!(deny_reason, "not allowed");
        assert_eq!(stream.state(), SessionState::Aborted);
        assert!(log.snapshot().is_empty());
    }

    #[tokio::test]
    async fn non_interrupting_denial_continues() {
        let handler = Arc::new(from_fn(|_ctx, _cancel| async {
            PermissionDecision::deny("read only", false)
        }));
        let (mut stream, log) =
            scripted_with(builtin("tool-use"), handler, PermissionConfig::default());
        let messages: Vec<_> = stream.by_ref().collect().await;
        assert_eq!(messages.len(), 5);
        assert!(messages.iter().all(|m| m.is_ok()));

        let resolutions = log.snapshot();
        assert_eq!(
            resolutions,
            vec![ToolResolution::Deny {
                tool_use_id: "t1".into(),
                tool_name: "write_file".into(),
                message: "access denied: read only".into(),
            }]
        );
        assert_eq!(stream.finished().await, SessionState::Completed);
    }

    #[tokio::test]
    async fn allow_forwards_updated_input() {
        let handler = Arc::new(from_fn(|_ctx, _cancel| async {
            PermissionDecision::Allow {
                updated_input: Some(serde_json::json!({"path": "sandbox/out.txt"})),
            }
        }));
        let (stream, log) = scripted_with(builtin("tool-use"), handler, PermissionConfig::default());
        let _: Vec<_> = stream.collect().await;
        let ToolResolution::Allow { input, .. } = &log.snapshot()[0] else {
            panic!("expected allow")
        };
        assert_eq!(input["path"], "sandbox/out.txt");
    }

    #[tokio::test]
    async fn one_decision_per_tool_use_before_next_turn() {
        let decided = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&decided);
        let handler = Arc::new(from_fn(move |_ctx, _cancel| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                PermissionDecision::allow()
            }
        }));
        let (mut stream, log) =
            scripted_with(builtin("multi-turn"), handler, PermissionConfig::default());

        let mut results_seen = 0;
        while let Some(msg) = stream.next().await {
            let msg = msg.unwrap();
            let has_result = msg
                .content()
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }));
            if has_result {
                results_seen += 1;
                assert!(decided.load(Ordering::SeqCst) >= results_seen);
            }
        }
        assert_eq!(results_seen, 2);
        assert_eq!(decided.load(Ordering::SeqCst), 2);
        let ids: Vec<_> = log.snapshot().iter().map(|r| r.tool_use_id().to_owned()).collect();
        assert_eq!(ids, ["t1", "t2"]);
    }

    #[tokio::test]
    async fn pending_handler_times_out_and_aborts() {
        let handler = Arc::new(from_fn(|_ctx, _cancel| {
            std::future::pending::<PermissionDecision>()
        }));
        let config = PermissionConfig {
            timeout: Duration::from_millis(50),
        };
        let started = std::time::Instant::now();
        let (mut stream, _) = scripted_with(builtin("tool-use"), handler, config);
        let last = stream.by_ref().collect::<Vec<_>>().await.pop().unwrap();
        assert!(matches!(
            last,
            Err(SessionError::ToolPermissionTimeout { timeout_ms: 50, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stream.finished().await, SessionState::Aborted);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_session() {
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new(Arc::new(builtin("slow")));
        let mut stream = SessionStream::from_transport(
            Box::new(transport),
            Mediator::new(Arc::new(AllowAll), PermissionConfig::default()),
            None,
            cancel.clone(),
        );
        assert!(stream.next().await.unwrap().is_ok());
        cancel.cancel();
        assert!(matches!(
            stream.next().await,
            Some(Err(SessionError::Cancelled))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.finished().await, SessionState::Aborted);
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        async fn transcript() -> Vec<String> {
            let (stream, _) = scripted(builtin("multi-turn"));
            stream
                .map(|m| serde_json::to_string(&m.unwrap()).unwrap())
                .collect()
                .await
        }
        let first = transcript().await;
        assert_eq!(first.len(), 7);
        assert_eq!(first, transcript().await);
    }

    #[tokio::test]
    async fn missing_result_is_incomplete() {
        let scenario = Scenario::new(
            "truncated",
            vec![Message::Assistant(AssistantMessage::new(vec![
                ContentBlock::text("partial"),
            ]))],
        );
        let (mut stream, _) = scripted(scenario);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await,
            Some(Err(SessionError::Incomplete))
        ));
        assert_eq!(stream.finished().await, SessionState::Failed);
    }

    #[tokio::test]
    async fn tool_result_for_unknown_id_is_a_protocol_error() {
        let scenario = Scenario::new(
            "orphan",
            vec![
                Message::User(UserMessage::new(vec![ContentBlock::tool_result("t9", "x")])),
                Message::Result(ResultMessage::success(Usage::default())),
            ],
        );
        let (mut stream, _) = scripted(scenario);
        assert!(matches!(
            stream.next().await,
            Some(Err(SessionError::Protocol(_)))
        ));
        assert_eq!(stream.finished().await, SessionState::Failed);
    }

    #[tokio::test]
    async fn late_system_message_is_a_protocol_error() {
        let scenario = Scenario::new(
            "late-system",
            vec![
                Message::Assistant(AssistantMessage::new(vec![ContentBlock::text("hi")])),
                Message::System(SystemMessage::default()),
            ],
        );
        let (stream, _) = scripted(scenario);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(SessionError::Protocol(_))));
    }

    #[tokio::test]
    async fn duplicate_tool_use_id_is_a_protocol_error() {
        let tool = || {
            Message::Assistant(AssistantMessage::new(vec![ContentBlock::tool_use(
                "t1",
                "Read",
                serde_json::json!({}),
            )]))
        };
        let (stream, _) = scripted(Scenario::new("dup", vec![tool(), tool()]));
        let items: Vec<_> = stream.collect().await;
        assert!(matches!(items.last(), Some(Err(SessionError::Protocol(_)))));
    }

    #[tokio::test]
    async fn start_session_reports_missing_executable_before_spawning() {
        let request = SessionRequest::new("hi").with_options(QueryOptions {
            executable_paths: vec!["/usr/bin/agent".into(), "/opt/agent".into()],
            ..Default::default()
        });
        let err = start_session(request, Arc::new(AllowAll), CancellationToken::new())
            .await
            .err()
            .unwrap();
        let SessionError::CliNotFound { searched } = err else {
            panic!("expected CliNotFound, got {err:?}")
        };
        assert_eq!(
            searched,
            vec![PathBuf::from("/usr/bin/agent"), PathBuf::from("/opt/agent")]
        );
    }

    #[tokio::test]
    async fn start_session_routes_prompt_through_registry() {
        let registry = ScenarioRegistry::new();
        registry.map_pattern("bug", "error").unwrap();

        let stream = start_session(
            SessionRequest::scripted("fix this bug", registry.clone()),
            Arc::new(AllowAll),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let items: Vec<_> = stream.collect().await;
        let last = items.last().unwrap().as_ref().unwrap();
        assert!(last.as_result().unwrap().is_error);

        let stream = start_session(
            SessionRequest::scripted("add feature", registry),
            Arc::new(AllowAll),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(!items[1].as_ref().unwrap().as_result().unwrap().is_error);
    }
}
