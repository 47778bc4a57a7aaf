//! Supervision of extractor child processes.
//!
//! Each extractor run is owned by exactly one tokio task. The task pumps
//! stdout into a bounded channel, scans stderr for progress, watches a
//! cancellation token and always reaps the child before resolving with a
//! [`ProcessOutcome`].

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::progress::{LineSplitter, ProgressEvent, ProgressSink, parse_percent};

/// Upper bound on stderr kept for classification and logs.
pub const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

const STDOUT_READ_SIZE: usize = 64 * 1024;
const STDOUT_CHANNEL_DEPTH: usize = 8;

/// Terminal state of a supervised run.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub bytes_produced: bool,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub cancelled: bool,
    pub stderr: String,
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The extractor failed after bytes were already streamed to the client.
    pub fn interrupted(&self) -> bool {
        self.bytes_produced && !self.cancelled && !self.succeeded()
    }
}

/// Where progress for one run goes.
#[derive(Clone)]
pub struct ProgressRoute {
    pub sink: Arc<dyn ProgressSink>,
    pub session_id: String,
}

impl ProgressRoute {
    fn publish(&self, event: ProgressEvent) {
        self.sink.publish(&self.session_id, event);
    }
}

/// A running streaming extraction.
///
/// Dropping the job (or the guard taken out of it) cancels the run, which
/// terminates the child in the background.
pub struct StreamingJob {
    pub pid: Option<u32>,
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    outcome: oneshot::Receiver<ProcessOutcome>,
    cancel: CancellationToken,
    guard: DropGuard,
}

impl StreamingJob {
    /// Spawns `command` with piped output and hands it to a supervising task.
    pub fn spawn(
        mut command: Command,
        progress: Option<ProgressRoute>,
        kill_grace: Duration,
    ) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn()?;
        let pid = child.id();

        let (chunk_tx, chunks) = mpsc::channel(STDOUT_CHANNEL_DEPTH);
        let (outcome_tx, outcome) = oneshot::channel();
        let cancel = CancellationToken::new();

        tokio::spawn(supervise(
            child,
            chunk_tx,
            outcome_tx,
            cancel.clone(),
            progress,
            kill_grace,
        ));

        Ok(Self {
            pid,
            chunks,
            outcome,
            guard: cancel.clone().drop_guard(),
            cancel,
        })
    }

    /// Next stdout chunk; `None` once the process has exited and all output
    /// was delivered.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.chunks.recv().await
    }

    /// Asks the supervisor to terminate the child. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the supervisor to reap the child.
    pub async fn outcome(self) -> ProcessOutcome {
        let Self { outcome, guard, .. } = self;
        let result = outcome.await;
        drop(guard);
        result.unwrap_or_else(|_| ProcessOutcome {
            bytes_produced: false,
            exit_code: None,
            cancelled: true,
            stderr: String::new(),
        })
    }

    /// Splits the job into its chunk receiver and the guard whose drop
    /// cancels the run. Used once the response body takes ownership.
    pub fn into_stream_parts(self) -> (mpsc::Receiver<io::Result<Bytes>>, DropGuard) {
        (self.chunks, self.guard)
    }
}

async fn supervise(
    mut child: Child,
    chunk_tx: mpsc::Sender<io::Result<Bytes>>,
    outcome_tx: oneshot::Sender<ProcessOutcome>,
    cancel: CancellationToken,
    progress: Option<ProgressRoute>,
    kill_grace: Duration,
) {
    let pid = child.id();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; STDOUT_READ_SIZE];
    let mut err_buf = [0u8; 8192];
    let mut splitter = LineSplitter::default();
    let mut captured = String::new();
    let mut bytes_produced = false;
    let mut cancelled = false;

    // Progress redraws are not kept: a long run would otherwise push the
    // final error line out of the capture.
    let handle_line = |line: String, captured: &mut String| {
        let percent = parse_percent(&line);
        if let (Some(percent), Some(route)) = (percent, &progress) {
            route.publish(ProgressEvent { percent });
        }
        if percent.is_some() && line.trim_start().starts_with("[download]") {
            return;
        }
        if !line.trim().is_empty() {
            tracing::debug!(pid, "[extractor] {}", line.trim_end());
            capture_tail(captured, &line);
        }
    };

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(0) => stdout = None,
                Ok(n) => {
                    bytes_produced = true;
                    let chunk = Bytes::copy_from_slice(&out_buf[..n]);
                    if chunk_tx.send(Ok(chunk)).await.is_err() {
                        cancelled = true;
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(pid, error = %err, "reading extractor stdout failed");
                    let _ = chunk_tx.send(Err(err)).await;
                    stdout = None;
                }
            },
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(0) => {
                    if let Some(line) = splitter.finish() {
                        handle_line(line, &mut captured);
                    }
                    stderr = None;
                }
                Ok(n) => {
                    for line in splitter.feed(&err_buf[..n]) {
                        handle_line(line, &mut captured);
                    }
                }
                Err(err) => {
                    tracing::warn!(pid, error = %err, "reading extractor stderr failed");
                    stderr = None;
                }
            },
        }
    }

    // Closing our ends first means a child blocked on a full pipe sees EPIPE
    // instead of hanging through the grace period.
    drop(stdout);
    drop(stderr);

    let status = if cancelled {
        tracing::info!(pid, "client went away; terminating extractor");
        terminate(&mut child, kill_grace).await
    } else {
        child.wait().await
    };

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::error!(pid, error = %err, "waiting for extractor failed");
            None
        }
    };

    if let Some(route) = &progress {
        route.publish(ProgressEvent::COMPLETE);
    }

    let outcome = ProcessOutcome {
        bytes_produced,
        exit_code,
        cancelled,
        stderr: captured,
    };
    if outcome.interrupted() {
        tracing::warn!(
            pid,
            exit_code = ?outcome.exit_code,
            stderr = %outcome.stderr.trim(),
            "extractor failed after output began; response ended early"
        );
    }
    let _ = outcome_tx.send(outcome);
}

/// Appends `line` to `captured`, dropping the oldest text once the capture
/// exceeds [`STDERR_CAPTURE_LIMIT`].
fn capture_tail(captured: &mut String, line: &str) {
    captured.push_str(line);
    captured.push('\n');
    if captured.len() > STDERR_CAPTURE_LIMIT {
        let mut cut = captured.len() - STDERR_CAPTURE_LIMIT;
        while !captured.is_char_boundary(cut) {
            cut += 1;
        }
        captured.drain(..cut);
    }
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

/// Sends SIGTERM, waits up to `grace`, then SIGKILLs. Always reaps.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(pid, error = %err, "SIGTERM delivery failed");
        }
    }

    match time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid = child.id(), "extractor ignored SIGTERM; killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Captured result of a non-streaming run.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Why a bounded run did not produce [`CapturedOutput`].
#[derive(Debug)]
pub enum RunError {
    Io(io::Error),
    TimedOut,
}

/// Runs `command` to completion, collecting its output, within `limit`.
/// On expiry the child is terminated before returning.
pub async fn run_bounded(
    mut command: Command,
    limit: Duration,
    kill_grace: Duration,
) -> Result<CapturedOutput, RunError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let deadline = time::Instant::now() + limit;
    let mut child = command.spawn().map_err(RunError::Io)?;
    let stdout = tokio::spawn(drain(child.stdout.take()));
    let stderr = tokio::spawn(drain(child.stderr.take()));
    let drains = [stdout.abort_handle(), stderr.abort_handle()];

    let status = match time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status.map_err(RunError::Io)?,
        Err(_) => {
            if let Err(err) = terminate(&mut child, kill_grace).await {
                tracing::warn!(error = %err, "terminating timed-out extractor failed");
            }
            drains.iter().for_each(|drain| drain.abort());
            return Err(RunError::TimedOut);
        }
    };

    // A grandchild holding the pipes open keeps the drains waiting past the
    // child's exit; the same deadline applies to them.
    match time::timeout_at(deadline, async { (stdout.await, stderr.await) }).await {
        Ok((stdout, stderr)) => Ok(CapturedOutput {
            status,
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
        }),
        Err(_) => {
            tracing::warn!(%status, "extractor output still open after exit");
            drains.iter().for_each(|drain| drain.abort());
            Err(RunError::TimedOut)
        }
    }
}

async fn drain<R>(reader: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(err) = reader.read_to_end(&mut bytes).await {
            tracing::debug!(error = %err, "reading extractor output failed");
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
