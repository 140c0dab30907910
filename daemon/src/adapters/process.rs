//! Subprocess plumbing shared by all adapters.
//!
//! An adapter builds a `Command`, supplies a [`NativeParser`] for its
//! CLI's output format, and gets back an [`EventStream`] of canonical
//! events. The driver task owns the child process end-to-end: stdout is
//! consumed line by line, stderr is drained into a buffer for exit
//! classification, and cancellation follows SIGINT, a bounded grace
//! window, then SIGKILL. The child is reaped on every exit path.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use overture_events::{CanonicalEvent, ErrorKind};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Availability;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Max unparseable output buffered before it is discarded with a warning.
pub(crate) const GARBAGE_CAP_BYTES: usize = 64 * 1024;

/// Exit facts handed to the parser after the stream closes.
#[derive(Debug, Clone)]
pub(crate) struct ExitSummary {
    pub code: Option<i32>,
    pub success: bool,
    pub stderr: String,
}

/// Per-adapter output parser. `parse_line` maps one stdout line to zero
/// or more canonical events; `finish` produces the terminal events once
/// the subprocess has exited (not called after cancellation).
pub(crate) trait NativeParser: Send + 'static {
    fn parse_line(&mut self, line: &str) -> Vec<CanonicalEvent>;
    fn finish(&mut self, exit: ExitSummary) -> Vec<CanonicalEvent>;
}

/// Tracks unparseable output without crashing the stream.
#[derive(Default)]
pub(crate) struct GarbageBuffer {
    buffered: usize,
    seen: bool,
}

impl GarbageBuffer {
    pub(crate) fn note(&mut self, line: &str) {
        self.seen = true;
        self.buffered += line.len() + 1;
        if self.buffered >= GARBAGE_CAP_BYTES {
            warn!(
                bytes = self.buffered,
                "discarding unparseable subprocess output"
            );
            self.buffered = 0;
        }
    }

    pub(crate) fn seen_any(&self) -> bool {
        self.seen
    }
}

/// Lazy, finite, single-consumer sequence of canonical events for one run.
pub struct EventStream {
    rx: mpsc::Receiver<CanonicalEvent>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<CanonicalEvent> {
        self.rx.recv().await
    }

    /// Pre-baked stream, used by tests.
    pub fn from_events(events: Vec<CanonicalEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity covers the whole vec; try_send cannot fail here.
            let _ = tx.try_send(event);
        }
        Self { rx }
    }
}

/// Build the sanitized command every adapter starts from: workspace as
/// cwd, minimal environment plus the adapter's pass-through prefixes,
/// piped stdio, kill-on-drop as the leak backstop.
pub(crate) fn base_command(program: &str, workspace: &Path, env_prefixes: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(workspace);
    cmd.env_clear();
    for key in ["PATH", "HOME", "USER", "SHELL", "LANG", "TERM"] {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    for (key, value) in std::env::vars() {
        if env_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
            cmd.env(&key, value);
        }
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Probe a CLI with its version flag. Missing binary, non-zero exit, or
/// a hung probe all count as not installed.
pub(crate) async fn probe_version(program: &str, args: &[&str]) -> Availability {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Err(_) => Availability::missing(format!("{program} version probe timed out")),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Availability::missing(format!("{program} is not installed"))
        }
        Ok(Err(e)) => Availability::missing(format!("failed to run {program}: {e}")),
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            Availability {
                installed: true,
                version,
                error: None,
            }
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let error = if stderr.is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                stderr
            };
            Availability::missing(error)
        }
    }
}

/// Spawn the subprocess and drive it to completion on a background task.
///
/// Termination behavior:
/// - clean or crashed exit: `parser.finish` produces the terminal events;
/// - cancellation: SIGINT, quiet drain bounded by `grace`, SIGKILL, then
///   a single `Status{cancelled}` regardless of how the child exited.
pub(crate) fn spawn_run<P: NativeParser>(
    mut cmd: Command,
    mut parser: P,
    cancel: CancellationToken,
    grace: Duration,
    stdin_payload: Option<String>,
) -> EventStream {
    let (tx, rx) = mpsc::channel::<CanonicalEvent>(64);

    tokio::spawn(async move {
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::CliNotInstalled
                } else {
                    ErrorKind::SpawnFailed
                };
                let _ = tx
                    .send(CanonicalEvent::error(
                        kind,
                        format!("failed to start subprocess: {e}"),
                    ))
                    .await;
                let _ = tx.send(CanonicalEvent::status_failed(kind)).await;
                return;
            }
        };

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        } else {
            drop(child.stdin.take());
        }

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut b) = buf.lock() {
                        if !b.is_empty() {
                            b.push('\n');
                        }
                        b.push_str(&line);
                    }
                }
            });
        }

        let Some(stdout) = child.stdout.take() else {
            let _ = tx
                .send(CanonicalEvent::error(
                    ErrorKind::SpawnFailed,
                    "stdout not captured",
                ))
                .await;
            let _ = tx.send(CanonicalEvent::status_failed(ErrorKind::SpawnFailed)).await;
            reap(&mut child).await;
            return;
        };
        let mut lines = BufReader::new(stdout).lines();

        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    interrupt(&child);
                    break;
                }
                next = lines.next_line() => match next {
                    Ok(Some(line)) => {
                        for event in parser.parse_line(&line) {
                            if tx.send(event).await.is_err() {
                                // Consumer went away; stop the child and bail.
                                reap(&mut child).await;
                                return;
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }

        if cancelled {
            let deadline = tokio::time::Instant::now() + grace;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = child.start_kill();
                        break;
                    }
                    next = lines.next_line() => match next {
                        // Output after the interrupt is not forwarded; the
                        // run's trailing events are synthesized upstream.
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => break,
                    }
                }
            }
            let _ = child.wait().await;
            let _ = tx.send(CanonicalEvent::status_cancelled()).await;
            return;
        }

        let status = child.wait().await;
        let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();
        let exit = ExitSummary {
            code: status.as_ref().ok().and_then(|s| s.code()),
            success: status.map(|s| s.success()).unwrap_or(false),
            stderr,
        };
        for event in parser.finish(exit) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });

    EventStream { rx }
}

fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGINT);
        }
    }
}

async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Classify a subprocess that exited without reaching its own terminal
/// record.
pub(crate) fn classify_exit(
    exit: &ExitSummary,
    emitted_any: bool,
    resume_attempted: bool,
    garbage_seen: bool,
) -> (ErrorKind, String) {
    let stderr_lower = exit.stderr.to_lowercase();

    let stale = resume_attempted
        && (stderr_lower.contains("--resume")
            || (stderr_lower.contains("session")
                && (stderr_lower.contains("not found")
                    || stderr_lower.contains("expired")
                    || stderr_lower.contains("invalid"))));
    if stale {
        return (
            ErrorKind::SessionStale,
            "prior session was rejected by the CLI".to_string(),
        );
    }

    let auth = ["not logged in", "please log in", "please login", "authentication required", "unauthorized", "api key"]
        .iter()
        .any(|needle| stderr_lower.contains(needle));
    if auth {
        return (ErrorKind::AuthMissing, exit_message(exit, "CLI requires login"));
    }

    if stderr_lower.contains("rate limit") || stderr_lower.contains("429") {
        return (
            ErrorKind::RateLimited,
            exit_message(exit, "provider rate limit reported"),
        );
    }

    if !emitted_any {
        if garbage_seen {
            return (
                ErrorKind::Protocol,
                exit_message(exit, "subprocess produced no parseable events"),
            );
        }
        return (
            ErrorKind::CrashedBeforeFirstEvent,
            exit_message(exit, "subprocess exited before emitting any event"),
        );
    }

    (
        ErrorKind::Protocol,
        exit_message(exit, "subprocess exited without a terminal record"),
    )
}

fn exit_message(exit: &ExitSummary, prefix: &str) -> String {
    let code = exit
        .code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    if exit.stderr.is_empty() {
        format!("{prefix} (exit {code})")
    } else {
        // Keep the stderr tail; CLIs often dump long usage text first.
        let tail: String = exit
            .stderr
            .chars()
            .rev()
            .take(500)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        format!("{prefix} (exit {code}): {tail}")
    }
}
