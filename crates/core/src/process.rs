//! Supervision of external tool processes.
//!
//! Every external tool the pipeline drives goes through [`run_streaming`]:
//! output from stdout and stderr is merged and split on both `\r` and `\n`
//! (progress bars redraw with carriage returns), and cancellation escalates
//! from SIGTERM to a hard kill after a grace period.

use futures::StreamExt;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of trailing output lines kept for error reporting.
const TAIL_LINES: usize = 20;

/// Longest single output segment accepted before it is discarded.
const MAX_SEGMENT_LEN: usize = 64 * 1024;

/// Errors from running an external tool.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{program} not found")]
    NotFound { program: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("process cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Bounds applied to one process run.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    /// How long a process gets between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Hard limit on the whole run.
    pub timeout: Option<Duration>,
}

impl ProcessLimits {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a supervised process ended.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub tail: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// The trailing output joined into one string.
    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }
}

/// Spawns `command` and feeds every output line to `on_line` until it exits.
pub async fn run_streaming<F>(
    mut command: Command,
    cancel: &CancellationToken,
    limits: ProcessLimits,
    mut on_line: F,
) -> Result<ProcessOutcome, ProcessError>
where
    F: FnMut(&str) + Send,
{
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ProcessError::NotFound {
                program: program.clone(),
            }
        } else {
            ProcessError::Spawn {
                program: program.clone(),
                source,
            }
        }
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr not captured"))?;

    let mut lines = futures::stream::select(
        FramedRead::new(stdout, line_codec()),
        FramedRead::new(stderr, line_codec()),
    );

    let deadline = limits.timeout.map(|t| Instant::now() + t);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Cancelling {}", program);
                terminate(&mut child, limits.grace).await;
                return Err(ProcessError::Cancelled);
            }
            _ = until(deadline) => {
                warn!("{} exceeded its time limit, terminating", program);
                terminate(&mut child, limits.grace).await;
                return Err(ProcessError::Timeout(limits.timeout.unwrap_or_default()));
            }
            next = lines.next() => match next {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(&chunk);
                    let line = text.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(target: "decklift::tool", "{}: {}", program, line);
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                    on_line(line);
                }
                Some(Err(e)) => debug!("{}: unreadable output: {}", program, e),
                None => break,
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            terminate(&mut child, limits.grace).await;
            return Err(ProcessError::Cancelled);
        }
    };

    Ok(ProcessOutcome {
        status,
        tail: tail.into_iter().collect(),
    })
}

/// Asks a child to stop, then kills it if it is still alive after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        debug!("Failed to signal child: {}", e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("Process ignored termination for {:?}, killing", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill process: {}", e);
            }
        }
    }
}

/// Locates a tool: paths are checked directly, bare names are looked up on `PATH`.
pub fn resolve_tool(tool: &Path) -> Option<PathBuf> {
    if tool.is_absolute() || tool.components().count() > 1 {
        return tool.is_file().then(|| tool.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), Vec::new(), MAX_SEGMENT_LEN)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
