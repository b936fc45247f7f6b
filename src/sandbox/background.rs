//! Detached commands for backends whose exec API only blocks.
//!
//! The command is launched under `nohup` with merged output redirected to a
//! log file in the sandbox temp dir. When the caller wants output, a spawned
//! task polls the log from the last byte offset. Each poll checks liveness
//! with `kill -0` (zombies count as exited) before measuring and reading the
//! log, so the poll that sees the process gone also reads its final output.
//! On timeout the follower stops; the process keeps running.

use super::{
    shell_quote, with_env_and_cwd, BackgroundOptions, CommandOptions, OutputCallback, Result,
    SandboxError, SandboxSession,
};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const RUNNING_MARKER: &str = "__TERRAGON_RUNNING__";
const EXITED_MARKER: &str = "__TERRAGON_EXITED__";

/// Launch `command` detached and, if `options.on_output` is set, follow its
/// log on a background task.
pub async fn dispatch_detached<S>(session: &S, command: &str, options: BackgroundOptions) -> Result<()>
where
    S: SandboxSession + Clone + 'static,
{
    spawn_detached(session, command, options).await.map(drop)
}

/// Like [`dispatch_detached`], returning the follower task if one was spawned.
async fn spawn_detached<S>(
    session: &S,
    command: &str,
    options: BackgroundOptions,
) -> Result<Option<JoinHandle<()>>>
where
    S: SandboxSession + Clone + 'static,
{
    let cwd = options
        .cwd
        .as_deref()
        .map(|c| session.resolve_path(c))
        .unwrap_or_else(|| session.repo_path());
    let log_path = format!(
        "{}/terragon-bg-{}.log",
        session.temp_dir(),
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    );
    let inner = with_env_and_cwd(command, &options.env, &cwd);
    let launch = format!(
        "nohup sh -c {} > {} 2>&1 < /dev/null & echo $!",
        shell_quote(&inner),
        shell_quote(&log_path)
    );

    let pid_out = session
        .run_command(
            &launch,
            CommandOptions::new()
                .cwd(session.home_path())
                .timeout(LAUNCH_TIMEOUT),
        )
        .await?;
    let pid: u32 = pid_out.trim().parse().map_err(|_| {
        SandboxError::transport(format!("could not parse background pid from {pid_out:?}"))
    })?;

    tracing::debug!(
        sandbox_id = %session.sandbox_id(),
        pid,
        log = %log_path,
        "Dispatched background command"
    );

    let Some(on_output) = options.on_output.clone() else {
        return Ok(None);
    };
    let session = session.clone();
    let timeout = options.effective_timeout();
    Ok(Some(tokio::spawn(async move {
        follow_log(session, pid, log_path, timeout, on_output).await;
    })))
}

async fn follow_log<S: SandboxSession>(
    session: S,
    pid: u32,
    log_path: String,
    timeout: Duration,
    on_output: OutputCallback,
) {
    let deadline = Instant::now() + timeout;
    let mut offset: usize = 0;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let log = shell_quote(&log_path);
        let probe = format!(
            "st=$(kill -0 {pid} 2>/dev/null && ! grep -qs ') Z' /proc/{pid}/stat \
             && echo {RUNNING_MARKER} || echo {EXITED_MARKER}); \
             size=$(wc -c 2>/dev/null < {log} || echo 0); size=$((size + 0)); \
             head -c \"$size\" {log} 2>/dev/null | tail -c +{start}; \
             printf '\\n%s %s' \"$st\" \"$size\"",
            start = offset + 1,
        );
        let out = match session
            .run_command(&probe, CommandOptions::new().timeout(LAUNCH_TIMEOUT))
            .await
        {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(pid, error = %e, "Background log poll failed, stopping follower");
                return;
            }
        };

        let probe = split_probe(&out);
        if !probe.chunk.is_empty() {
            on_output(probe.chunk);
        }
        offset = probe.log_size.unwrap_or(offset + probe.chunk.len()).max(offset);

        if probe.status == EXITED_MARKER {
            tracing::debug!(pid, "Background command exited");
            return;
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                pid,
                timeout_ms = timeout.as_millis() as u64,
                "Background command timed out; leaving process running"
            );
            return;
        }
    }
}

struct Poll<'a> {
    chunk: &'a str,
    status: &'a str,
    /// Log size in bytes when the chunk was read.
    log_size: Option<usize>,
}

/// Split poll output into the new log chunk, the liveness marker and the
/// log size.
fn split_probe(out: &str) -> Poll<'_> {
    let (chunk, tail) = out.rsplit_once('\n').unwrap_or(("", out));
    let mut fields = tail.split_whitespace();
    Poll {
        chunk,
        status: fields.next().unwrap_or_default(),
        log_size: fields.next().and_then(|n| n.parse().ok()),
    }
}
