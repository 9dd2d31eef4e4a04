use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Record, ToolResolution, Transport};
use crate::discovery::resolve_executable;
use crate::types::{InputMode, McpServerConfig, PermissionMode, QueryOptions};
use crate::{Result, SessionError};

/// Stderr kept for diagnostics. Older lines are dropped once this is exceeded.
pub const STDERR_CAP_BYTES: usize = 64 * 1024;

/// How long a failed prompt write waits for the agent's exit status.
const EARLY_EXIT_WAIT: Duration = Duration::from_millis(500);

/// How long teardown waits between the graceful signal and a forced kill.
#[derive(Debug, Clone, Copy)]
pub struct TeardownConfig {
    pub grace: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
        }
    }
}

// ─── ProcessTransport ─────────────────────────────────────────────────────

/// A running `claude --output-format stream-json --input-format stream-json`
/// subprocess.
///
/// Stdout is drained continuously by a background task so the child never
/// blocks on a full pipe while a permission decision is pending. Stdin is
/// owned by a writer task fed through a channel, which keeps
/// [`Transport::resolve_tool`] non-blocking. Stderr is captured into a bounded
/// buffer and attached to exit errors.
pub struct ProcessTransport {
    child: Child,
    lines: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    stdin: Option<mpsc::UnboundedSender<String>>,
    stderr: Arc<Mutex<StderrBuffer>>,
    stderr_task: Option<JoinHandle<()>>,
    permissions: PermissionRouter,
    teardown: TeardownConfig,
    terminated: bool,
}

impl ProcessTransport {
    /// Resolve the executable, spawn it, and send the prompt.
    ///
    /// Fails with [`SessionError::CliNotFound`] before anything is spawned
    /// when no executable is found, and with [`SessionError::CliConnection`]
    /// when the process cannot be launched or refuses the prompt.
    ///
    /// `CLAUDECODE` is removed from the environment so sessions can be
    /// started from inside a running Claude session.
    pub async fn start(prompt: &str, opts: &QueryOptions, teardown: TeardownConfig) -> Result<Self> {
        let exe = resolve_executable(&opts.executable_paths)?;
        let mut cmd = build_command(&exe, opts);
        cmd.env_remove("CLAUDECODE");
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let (mut transport, mut stdin) = Self::from_command(cmd, teardown)?;
        tracing::info!(
            executable = %exe.display(),
            pid = transport.child.id(),
            "spawned claude subprocess"
        );

        transport.send_prompt(&mut stdin, prompt).await?;

        match opts.input_mode {
            InputMode::Streaming => transport.stdin = Some(spawn_writer(stdin)),
            // Dropping stdin signals end of input.
            InputMode::SingleShot => drop(stdin),
        }

        Ok(transport)
    }

    fn from_command(mut cmd: Command, teardown: TeardownConfig) -> Result<(Self, ChildStdin)> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SessionError::CliConnection {
            message: format!("failed to spawn {:?}", cmd.as_std().get_program()),
            source: Some(e),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| SessionError::CliConnection {
            message: "stdout not captured".into(),
            source: None,
        })?;
        let stdin = child.stdin.take().ok_or_else(|| SessionError::CliConnection {
            message: "stdin not captured".into(),
            source: None,
        })?;

        // Raw bytes: UTF-8 is checked per record so a bad line surfaces as a
        // decode failure carrying its text.
        let (line_tx, lines) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut buf = Vec::new();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if line_tx.send(Ok(buf)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = line_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let stderr = Arc::new(Mutex::new(StderrBuffer::new(STDERR_CAP_BYTES)));
        let stderr_task = child.stderr.take().map(|pipe| {
            let buf = Arc::clone(&stderr);
            tokio::spawn(drain_stderr(pipe, buf))
        });

        Ok((
            Self {
                child,
                lines,
                stdin: None,
                stderr,
                stderr_task,
                permissions: PermissionRouter::default(),
                teardown,
                terminated: false,
            },
            stdin,
        ))
    }

    /// Write the prompt as a stream-json user message. An agent that exits
    /// before reading it (bad flag, auth failure) is reported with its exit
    /// status and stderr.
    async fn send_prompt(&mut self, stdin: &mut ChildStdin, prompt: &str) -> Result<()> {
        let user_msg = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": prompt}]
            }
        });
        let Err(e) = write_line(stdin, &user_msg.to_string()).await else {
            return Ok(());
        };

        let mut message = String::from("failed to write the initial prompt");
        if let Ok(Ok(status)) = tokio::time::timeout(EARLY_EXIT_WAIT, self.child.wait()).await {
            message.push_str(&format!("; claude exited with {status}"));
            if let Some(task) = self.stderr_task.take() {
                let _ = tokio::time::timeout(EARLY_EXIT_WAIT, task).await;
            }
        }
        let stderr = self.stderr();
        if !stderr.is_empty() {
            message.push_str(&format!("\n{stderr}"));
        }
        self.shutdown().await;
        Err(SessionError::CliConnection {
            message,
            source: Some(e),
        })
    }

    /// Everything captured from stderr so far.
    pub fn stderr(&self) -> String {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contents()
    }

    fn send_line(&mut self, line: String) {
        match &self.stdin {
            Some(tx) => {
                if tx.send(line).is_err() {
                    tracing::debug!("stdin writer has exited; dropping line");
                }
            }
            None => tracing::debug!("stdin is closed; dropping line"),
        }
    }

    /// Handle permission-handshake traffic. Returns `true` when the line was
    /// consumed and must not reach the decoder.
    fn intercept_control(&mut self, line: &str) -> bool {
        if !line.contains("\"control_") {
            return false;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return false;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("control_request") => {
                self.on_control_request(&value);
                true
            }
            Some("control_response") => {
                let request_id = value
                    .pointer("/response/request_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                tracing::debug!(%request_id, "received control_response");
                true
            }
            Some("control_cancel_request") => {
                if let Some(id) = value.get("request_id").and_then(Value::as_str) {
                    self.permissions.cancel(id);
                }
                true
            }
            _ => false,
        }
    }

    fn on_control_request(&mut self, value: &Value) {
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let request = value.get("request").cloned().unwrap_or(Value::Null);
        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if subtype != "can_use_tool" {
            tracing::warn!(%request_id, subtype, "unsupported control request");
            let reply = control_error(&request_id, &format!("unsupported control request: {subtype}"));
            self.send_line(reply.to_string());
            return;
        }

        let pending = PendingRequest {
            request_id,
            tool_name: request
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            tool_use_id: request
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
        };
        tracing::debug!(
            request_id = %pending.request_id,
            tool = %pending.tool_name,
            "permission requested by agent"
        );
        if let Some((request_id, resolution)) = self.permissions.on_request(pending) {
            self.send_line(control_response(&request_id, &resolution).to_string());
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            // The channel receive is the only await point, which keeps this
            // cancel-safe.
            let bytes = match self.lines.recv().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(SessionError::Io(e)),
                Some(Ok(bytes)) => bytes,
            };
            let line = match String::from_utf8(bytes) {
                Ok(line) => line,
                Err(e) => return Err(invalid_utf8_record(e.as_bytes())),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            tracing::trace!(line = trimmed, "stdout");
            if self.intercept_control(trimmed) {
                continue;
            }
            return Ok(Some(Record::Line(trimmed.to_owned())));
        }
    }

    fn tool_finished(&mut self, tool_use_id: &str) {
        self.permissions.forget(tool_use_id);
    }

    fn resolve_tool(&mut self, resolution: ToolResolution) -> Result<()> {
        if self.stdin.is_none() {
            if let ToolResolution::Deny { tool_use_id, .. } = &resolution {
                tracing::debug!(%tool_use_id, "single-shot input; denial cannot be sent to the agent");
            }
            return Ok(());
        }
        if let Some((request_id, resolution)) = self.permissions.on_resolution(resolution) {
            self.send_line(control_response(&request_id, &resolution).to_string());
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let status = self.child.wait().await?;

        // Let the stderr reader catch up with whatever the child wrote last.
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        if status.success() {
            return Ok(());
        }
        Err(SessionError::Process {
            exit_code: status.code(),
            stderr: self.stderr(),
        })
    }

    async fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        // Closing stdin ends a streaming-input session on the agent's side.
        self.stdin.take();

        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(%status, "claude subprocess already exited");
            return;
        }

        send_terminate(&self.child);
        match tokio::time::timeout(self.teardown.grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "claude subprocess exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed waiting for claude subprocess"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.teardown.grace.as_millis() as u64,
                    "claude subprocess ignored SIGTERM; killing"
                );
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(error = %e, "failed to kill claude subprocess");
                }
            }
        }
    }
}

/// Keep reading until EOF whatever the child writes; closing the pipe early
/// would kill the child with SIGPIPE on its next write.
async fn drain_stderr(pipe: ChildStderr, buf: Arc<Mutex<StderrBuffer>>) {
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                buf.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_line(text);
            }
            Err(e) => {
                tracing::debug!(error = %e, "claude stderr read failed");
                break;
            }
        }
    }
}

/// A stdout record that is not UTF-8 cannot be JSON; report it with its
/// (lossily decoded) text like any other malformed line.
fn invalid_utf8_record(bytes: &[u8]) -> SessionError {
    let line = String::from_utf8_lossy(bytes).trim().to_owned();
    let source = match serde_json::from_slice::<Value>(bytes) {
        Err(e) => e,
        Ok(_) => serde::de::Error::custom("record is not valid UTF-8"),
    };
    SessionError::JsonDecode { line, source }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Own stdin in a task so writes never block the session controller.
/// Dropping every sender closes stdin.
fn spawn_writer(mut stdin: ChildStdin) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut stdin, &line).await {
                tracing::warn!(error = %e, "failed to write to claude stdin");
                break;
            }
        }
    });
    tx
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(error = %e, pid, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

// ─── Permission handshake ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingRequest {
    request_id: String,
    tool_name: String,
    tool_use_id: Option<String>,
}

impl PendingRequest {
    fn matches(&self, resolution: &ToolResolution) -> bool {
        match &self.tool_use_id {
            Some(id) => id == resolution.tool_use_id(),
            None => self.tool_name == resolution.tool_name(),
        }
    }
}

/// Pairs agent `can_use_tool` requests with host resolutions. Either side
/// may arrive first; whichever completes a pair releases the response.
///
/// The agent never asks about tools it approves on its own, so a resolution
/// may never be claimed. Those are dropped once the tool's result shows up.
#[derive(Debug, Default)]
struct PermissionRouter {
    requests: VecDeque<PendingRequest>,
    resolutions: VecDeque<ToolResolution>,
}

impl PermissionRouter {
    fn on_request(&mut self, request: PendingRequest) -> Option<(String, ToolResolution)> {
        // Without an id, the most recent decision for that tool is the one the
        // agent is waiting on.
        let found = match request.tool_use_id {
            Some(_) => self.resolutions.iter().position(|r| request.matches(r)),
            None => self.resolutions.iter().rposition(|r| request.matches(r)),
        };
        match found {
            Some(idx) => {
                let resolution = self.resolutions.remove(idx)?;
                Some((request.request_id, resolution))
            }
            None => {
                self.requests.push_back(request);
                None
            }
        }
    }

    fn on_resolution(&mut self, resolution: ToolResolution) -> Option<(String, ToolResolution)> {
        match self.requests.iter().position(|r| r.matches(&resolution)) {
            Some(idx) => {
                let request = self.requests.remove(idx)?;
                Some((request.request_id, resolution))
            }
            None => {
                self.resolutions.push_back(resolution);
                None
            }
        }
    }

    fn cancel(&mut self, request_id: &str) {
        self.requests.retain(|r| r.request_id != request_id);
    }

    fn forget(&mut self, tool_use_id: &str) {
        let before = self.resolutions.len();
        self.resolutions.retain(|r| r.tool_use_id() != tool_use_id);
        if self.resolutions.len() != before {
            tracing::debug!(%tool_use_id, "tool ran without a permission request");
        }
    }
}

/// `control_response` answering a `can_use_tool` request.
///
/// The CLI requires `updatedInput` on allow, so the original input is sent
/// back when the host did not replace it.
fn control_response(request_id: &str, resolution: &ToolResolution) -> Value {
    let response = match resolution {
        ToolResolution::Allow { input, .. } => serde_json::json!({
            "behavior": "allow",
            "updatedInput": input,
        }),
        ToolResolution::Deny { message, .. } => serde_json::json!({
            "behavior": "deny",
            "message": message,
            "interrupt": false,
        }),
    };
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

fn control_error(request_id: &str, error: &str) -> Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        }
    })
}

// ─── Stderr capture ───────────────────────────────────────────────────────

/// Line buffer capped at `cap` bytes; the oldest lines go first.
#[derive(Debug)]
struct StderrBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    dropped: usize,
    cap: usize,
}

impl StderrBuffer {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            dropped: 0,
            cap,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_owned());
        while self.bytes > self.cap {
            let Some(old) = self.lines.pop_front() else {
                break;
            };
            self.bytes -= old.len() + 1;
            if self.dropped == 0 {
                tracing::warn!(cap = self.cap, "claude stderr exceeded capture limit; truncating");
            }
            self.dropped += old.len() + 1;
        }
    }

    fn contents(&self) -> String {
        let body = self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        if self.dropped == 0 {
            body
        } else {
            format!("[… {} bytes of earlier stderr truncated]\n{body}", self.dropped)
        }
    }
}

// ─── Command builder ──────────────────────────────────────────────────────

fn build_command(exe: &Path, opts: &QueryOptions) -> Command {
    let mut cmd = Command::new(exe);

    cmd.arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--input-format")
        .arg("stream-json");

    // Permission prompts arrive as control requests on stdout and are answered
    // on stdin, which only stays open in streaming mode.
    if opts.input_mode == InputMode::Streaming {
        cmd.arg("--permission-prompt-tool").arg("stdio");
    }

    if let Some(model) = &opts.model {
        cmd.arg("--model").arg(model);
    }

    if let Some(max_turns) = opts.max_turns {
        cmd.arg("--max-turns").arg(max_turns.to_string());
    }

    if let Some(budget) = opts.max_budget_usd {
        cmd.arg("--max-budget-usd").arg(budget.to_string());
    }

    if !opts.allowed_tools.is_empty() {
        cmd.arg("--allowed-tools").args(&opts.allowed_tools);
    }

    if !opts.disallowed_tools.is_empty() {
        cmd.arg("--disallowed-tools").args(&opts.disallowed_tools);
    }

    if opts.permission_mode != PermissionMode::Default {
        cmd.arg("--permission-mode")
            .arg(opts.permission_mode.as_str());
    }

    if let Some(sp) = &opts.system_prompt {
        cmd.arg("--system-prompt").arg(sp);
    }

    if let Some(append) = &opts.append_system_prompt {
        cmd.arg("--append-system-prompt").arg(append);
    }

    if let Some(resume) = &opts.resume {
        cmd.arg("--resume").arg(resume);
    }

    if let Some(sid) = &opts.session_id {
        cmd.arg("--session-id").arg(sid);
    }

    if !opts.mcp_servers.is_empty() {
        cmd.arg("--mcp-config")
            .arg(build_mcp_config_json(&opts.mcp_servers));
    }

    for dir in &opts.additional_directories {
        cmd.arg("--add-dir").arg(dir);
    }

    if opts.include_partial_messages {
        cmd.arg("--include-partial-messages");
    }

    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    // The prompt goes over stdin, never as a positional arg.

    cmd
}

/// `{"mcpServers":{"<name>":{"type":"stdio","command":"...","args":[...],"env":{...}}}}`
fn build_mcp_config_json(servers: &[McpServerConfig]) -> String {
    let mut mcp_servers = serde_json::Map::new();

    for srv in servers {
        let mut cfg = serde_json::Map::new();
        cfg.insert("type".into(), Value::String("stdio".into()));
        cfg.insert("command".into(), Value::String(srv.command.clone()));
        if !srv.args.is_empty() {
            cfg.insert("args".into(), serde_json::json!(srv.args));
        }
        if !srv.env.is_empty() {
            cfg.insert("env".into(), serde_json::json!(srv.env));
        }
        mcp_servers.insert(srv.name.clone(), Value::Object(cfg));
    }

    serde_json::json!({ "mcpServers": mcp_servers }).to_string()
}

// ─── Tests ────────────────────────────────────────────────────────────────
