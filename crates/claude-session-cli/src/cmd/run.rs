use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use claude_session::{
    from_fn, start_session, Message, PermissionContext, PermissionDecision, PermissionHandler,
    SessionRequest,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::output::{print_message, print_message_json};

#[derive(clap::Args)]
pub struct RunArgs {
    /// Prompt sent to the agent
    pub prompt: String,

    /// Replay a scripted scenario instead of spawning the Claude CLI
    #[arg(long)]
    pub scripted: bool,

    /// Seconds to wait for each permission decision (overrides config)
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Ask on the terminal before each tool runs instead of applying the
    /// configured policy
    #[arg(long)]
    pub ask: bool,
}

pub fn run(config_path: &Path, args: RunArgs, json: bool, verbose: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    let mut request = if args.scripted {
        SessionRequest::scripted(&args.prompt, config.registry()?)
    } else {
        SessionRequest::new(&args.prompt).with_options(config.query_options())
    };
    request.permission = config.permission_config(args.timeout_secs);

    let handler: Arc<dyn PermissionHandler> = if args.ask {
        Arc::new(ask_on_terminal())
    } else {
        Arc::new(config.policy())
    };

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = rt.block_on(drive(request, handler, json, verbose));
    // A terminal prompt may still be blocked on stdin.
    rt.shutdown_background();
    result
}

async fn drive(
    request: SessionRequest,
    handler: Arc<dyn PermissionHandler>,
    json: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling session");
            on_interrupt.cancel();
        }
    });

    tracing::info!(prompt = %request.prompt, "starting session");
    let mut stream = start_session(request, handler, cancel)
        .await
        .context("failed to start session")?;

    let mut error_result = None;
    while let Some(msg) = stream.next().await {
        let msg = msg.context("session failed")?;
        if json {
            print_message_json(&msg)?;
        } else {
            print_message(&msg, verbose);
        }
        if let Message::Result(r) = &msg {
            if r.is_error {
                error_result = Some(r.subtype.clone());
            }
        }
    }
    let state = stream.finished().await;
    tracing::info!(?state, "session finished");

    if let Some(subtype) = error_result {
        anyhow::bail!("session ended with an error result ({subtype})");
    }
    Ok(())
}

/// Prompt on stderr, read `y`/`n` from stdin. Anything but `y` denies without
/// interrupting; no answer before the deadline aborts the session.
fn ask_on_terminal() -> impl PermissionHandler {
    from_fn(|ctx: PermissionContext, cancel: CancellationToken| async move {
        eprint!("allow {} {}? [y/N] ", ctx.tool_name, ctx.input);
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        });
        tokio::select! {
            _ = cancel.cancelled() => PermissionDecision::deny("no answer from operator", true),
            answer = answer => match answer {
                Ok(Ok(line)) if line.trim().eq_ignore_ascii_case("y") => PermissionDecision::allow(),
                _ => PermissionDecision::deny("declined by operator", false),
            },
        }
    })
}
