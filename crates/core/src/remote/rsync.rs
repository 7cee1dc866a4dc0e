//! Remote channel built on the local `rsync`, `ssh` and `sshpass` binaries.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::RemoteError;
use super::traits::RemoteChannel;
use super::types::{remote_join, shell_quote, Credentials, PushEvent, PushSummary, RemoteEndpoint};
use crate::process::{resolve_tool, run_streaming, ProcessError, ProcessLimits};
use crate::stage::TransferConfig;

/// rsync exit codes worth retrying: network and timeout failures.
const TRANSIENT_EXIT_CODES: &[i32] = &[10, 12, 30, 35, 255];

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILED: i32 = 255;

/// Exit code of the read script when the file is missing.
const READ_MISSING: i32 = 3;

/// Bound on small remote commands (test, mkdir, rm, cat).
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

static VERSION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"version\s+(\d+)\.(\d+)").ok());

static PROGRESS: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^\s*([\d,]+)\s+(\d{1,3})%\s+([\d.]+)([kMGT]?)B/s").ok()
});

static TO_CHECK: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?:to|ir)-chk=(\d+)/(\d+)").ok());

/// Human-readable meaning of an rsync exit code.
pub fn rsync_exit_message(code: i32) -> &'static str {
    match code {
        0 => "success",
        1 => "syntax or usage error",
        2 => "protocol incompatibility",
        3 => "errors selecting input/output files",
        5 => "error starting client-server protocol",
        10 => "error in socket I/O",
        11 => "error in file I/O",
        12 => "error in rsync protocol data stream",
        23 => "partial transfer due to error",
        24 => "partial transfer due to vanished source files",
        30 => "timeout in data send/receive",
        35 => "timeout waiting for daemon connection",
        255 => "ssh connection failed",
        _ => "unknown rsync error",
    }
}

/// Pushes with rsync over ssh; small operations run as ssh commands.
pub struct RsyncChannel {
    rsync_path: PathBuf,
    ssh_path: PathBuf,
    sshpass_path: PathBuf,
    grace: Duration,
    /// Whether the local rsync understands `--info=progress2` (3.1+).
    progress2: OnceCell<bool>,
}

impl RsyncChannel {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            rsync_path: config.rsync_path.clone(),
            ssh_path: config.ssh_path.clone(),
            sshpass_path: config.sshpass_path.clone(),
            grace: Duration::from_secs(5),
            progress2: OnceCell::new(),
        }
    }

    /// Time rsync gets to exit after cancellation.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn supports_progress2(&self) -> bool {
        *self
            .progress2
            .get_or_init(|| async {
                let output = match Command::new(&self.rsync_path).arg("--version").output().await {
                    Ok(output) => output,
                    Err(e) => {
                        debug!("rsync version probe failed: {}", e);
                        return false;
                    }
                };
                let text = String::from_utf8_lossy(&output.stdout);
                let supported = parse_version(&text).is_some_and(|v| v >= (3, 1));
                debug!("rsync progress2 supported: {}", supported);
                supported
            })
            .await
    }

    fn ssh_options(&self, endpoint: &RemoteEndpoint) -> Vec<String> {
        let mut args = vec!["-p".to_string(), endpoint.port.to_string()];
        if let Credentials::KeyFile(key) = endpoint.credentials() {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        for option in [
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "ServerAliveInterval=30",
            "ServerAliveCountMax=10",
            "LogLevel=ERROR",
        ] {
            args.push("-o".to_string());
            args.push(option.to_string());
        }
        args
    }

    /// The `-e` argument for rsync.
    fn ssh_command_line(&self, endpoint: &RemoteEndpoint) -> String {
        std::iter::once(self.ssh_path.display().to_string())
            .chain(self.ssh_options(endpoint))
            .map(|arg| {
                if arg.contains(char::is_whitespace) {
                    shell_quote(&arg)
                } else {
                    arg
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A command for `program`, run through `sshpass -e` when a password is used.
    fn command(&self, program: &Path, endpoint: &RemoteEndpoint) -> Result<Command, RemoteError> {
        match endpoint.credentials() {
            Credentials::Password(secret) => {
                if resolve_tool(&self.sshpass_path).is_none() {
                    return Err(RemoteError::ToolNotFound {
                        tool: "sshpass".to_string(),
                        detail: format!(
                            "{} is required for password authentication",
                            self.sshpass_path.display()
                        ),
                    });
                }
                let mut cmd = Command::new(&self.sshpass_path);
                cmd.arg("-e").arg(program).env("SSHPASS", secret.expose());
                Ok(cmd)
            }
            Credentials::KeyFile(_) | Credentials::Agent => Ok(Command::new(program)),
        }
    }

    /// Runs a shell snippet on the remote side.
    async fn exec(
        &self,
        endpoint: &RemoteEndpoint,
        script: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Output, RemoteError> {
        let mut cmd = self.command(&self.ssh_path, endpoint)?;
        cmd.args(self.ssh_options(endpoint))
            .arg(endpoint.destination())
            .arg(script)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("ssh {}: {}", endpoint.destination(), script);
        let mut child = cmd.spawn().map_err(|e| spawn_error("ssh", e))?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
            drop(pipe);
        }

        let output = tokio::time::timeout(EXEC_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                RemoteError::transient(
                    format!("remote command timed out on {}", endpoint.host),
                    None,
                )
            })??;

        if output.status.code() == Some(SSH_CONNECTION_FAILED) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RemoteError::transient(
                format!("ssh to {} failed: {}", endpoint.host, stderr.trim()),
                Some(SSH_CONNECTION_FAILED),
            ));
        }
        Ok(output)
    }

    async fn exec_checked(&self, endpoint: &RemoteEndpoint, script: &str) -> Result<(), RemoteError> {
        let output = self.exec(endpoint, script, None).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(command_error(script, &output))
        }
    }
}

#[async_trait]
impl RemoteChannel for RsyncChannel {
    fn name(&self) -> &str {
        "rsync"
    }

    async fn validate(&self) -> Result<(), RemoteError> {
        for (tool, path) in [("rsync", &self.rsync_path), ("ssh", &self.ssh_path)] {
            if resolve_tool(path).is_none() {
                return Err(RemoteError::ToolNotFound {
                    tool: tool.to_string(),
                    detail: format!("{} is not installed or not executable", path.display()),
                });
            }
        }
        self.supports_progress2().await;
        Ok(())
    }

    async fn push(
        &self,
        endpoint: &RemoteEndpoint,
        local_dir: &Path,
        remote_dir: &str,
        events: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<PushSummary, RemoteError> {
        let (files_total, bytes_total) = tree_size(local_dir).await?;
        let progress2 = self.supports_progress2().await;

        let mut cmd = self.command(&self.rsync_path, endpoint)?;
        cmd.arg("-avzs")
            .arg(if progress2 { "--info=progress2" } else { "--progress" })
            .arg("--no-inc-recursive")
            .arg("-e")
            .arg(self.ssh_command_line(endpoint))
            .arg(format!("{}/", local_dir.display()))
            .arg(format!("{}:{}/", endpoint.destination(), remote_dir.trim_end_matches('/')));

        info!(
            "Pushing {} to {}:{}",
            local_dir.display(),
            endpoint.destination(),
            remote_dir
        );

        let mut parser = PushParser::new(progress2, files_total, bytes_total);
        let outcome = run_streaming(cmd, &cancel, ProcessLimits::new(self.grace), |line| {
            if let Some(event) = parser.parse(line, remote_dir) {
                // Best-effort; a slow consumer only loses intermediate updates.
                let _ = events.try_send(event);
            }
        })
        .await
        .map_err(|e| process_error("rsync", e))?;

        if outcome.success() {
            let _ = events.try_send(PushEvent::Progress {
                bytes_done: bytes_total,
                bytes_total,
                files_done: files_total,
                files_total,
                rate: None,
            });
            return Ok(PushSummary {
                files: files_total,
                bytes: bytes_total,
            });
        }

        let detail = outcome.tail.last().cloned().unwrap_or_default();
        match outcome.code() {
            Some(code) => {
                let message = format!(
                    "rsync failed: {} (exit {}): {}",
                    rsync_exit_message(code),
                    code,
                    detail
                );
                if TRANSIENT_EXIT_CODES.contains(&code) {
                    warn!("{}", message);
                    Err(RemoteError::transient(message, Some(code)))
                } else {
                    Err(RemoteError::command_failed(message, Some(code)))
                }
            }
            None => Err(RemoteError::command_failed(
                format!("rsync killed by signal: {}", detail),
                None,
            )),
        }
    }

    async fn exists(&self, endpoint: &RemoteEndpoint, remote_path: &str) -> Result<bool, RemoteError> {
        let script = format!("test -e {}", remote_path_arg(remote_path));
        let output = self.exec(endpoint, &script, None).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_error(&script, &output)),
        }
    }

    async fn create_dir_all(
        &self,
        endpoint: &RemoteEndpoint,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        self.exec_checked(endpoint, &format!("mkdir -p -- {}", remote_path_arg(remote_path)))
            .await
    }

    async fn remove(&self, endpoint: &RemoteEndpoint, remote_path: &str) -> Result<(), RemoteError> {
        self.exec_checked(endpoint, &format!("rm -rf -- {}", remote_path_arg(remote_path)))
            .await
    }

    async fn read_file(
        &self,
        endpoint: &RemoteEndpoint,
        remote_path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        let path = remote_path_arg(remote_path);
        let script = format!("test -e {path} || exit {READ_MISSING}; cat -- {path}");
        let output = self.exec(endpoint, &script, None).await?;
        match output.status.code() {
            Some(0) => Ok(Some(output.stdout)),
            Some(READ_MISSING) => Ok(None),
            _ => Err(command_error(&script, &output)),
        }
    }

    async fn write_file(
        &self,
        endpoint: &RemoteEndpoint,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<(), RemoteError> {
        let script = format!("cat > {}", remote_path_arg(remote_path));
        let output = self.exec(endpoint, &script, Some(contents)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(command_error(&script, &output))
        }
    }
}

/// Turns rsync output lines into push events.
#[derive(Debug)]
struct PushParser {
    progress2: bool,
    files_total: u64,
    bytes_total: u64,
    /// Bytes of files already finished; only used with per-file progress.
    completed: u64,
    files_done: u64,
}

impl PushParser {
    fn new(progress2: bool, files_total: u64, bytes_total: u64) -> Self {
        Self {
            progress2,
            files_total,
            bytes_total,
            completed: 0,
            files_done: 0,
        }
    }

    fn parse(&mut self, line: &str, remote_dir: &str) -> Option<PushEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(caps) = PROGRESS.as_ref()?.captures(trimmed) {
            let bytes: u64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
            let rate = parse_rate(caps.get(3)?.as_str(), caps.get(4)?.as_str());
            let check = TO_CHECK
                .as_ref()
                .and_then(|re| re.captures(trimmed))
                .and_then(|c| {
                    let remaining: u64 = c.get(1)?.as_str().parse().ok()?;
                    let total: u64 = c.get(2)?.as_str().parse().ok()?;
                    Some((remaining, total))
                });
            if let Some((remaining, total)) = check {
                self.files_total = self.files_total.max(total);
                self.files_done = total.saturating_sub(remaining);
            }

            let bytes_done = if self.progress2 {
                bytes
            } else {
                let done = self.completed + bytes;
                // A to-chk marker ends the current file.
                if check.is_some() {
                    self.completed = done;
                }
                done
            };
            return Some(PushEvent::Progress {
                bytes_done,
                bytes_total: self.bytes_total,
                files_done: self.files_done,
                files_total: self.files_total,
                rate,
            });
        }

        if is_file_line(trimmed) {
            return Some(PushEvent::FileStarted {
                remote_path: remote_join(remote_dir, trimmed),
            });
        }
        None
    }
}

fn is_file_line(line: &str) -> bool {
    const NOISE: &[&str] = &[
        "sending incremental file list",
        "building file list",
        "sent ",
        "total size",
        "created directory",
        "receiving",
    ];
    !line.ends_with('/') && !NOISE.iter().any(|prefix| line.starts_with(prefix))
}

fn parse_rate(value: &str, unit: &str) -> Option<f64> {
    let value: f64 = value.parse().ok()?;
    let multiplier = match unit {
        "" => 1.0,
        "k" => 1024.0,
        "M" => 1024.0 * 1024.0,
        "G" => 1024.0 * 1024.0 * 1024.0,
        "T" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * multiplier)
}

fn parse_version(text: &str) -> Option<(u32, u32)> {
    let caps = VERSION.as_ref()?.captures(text)?;
    Some((caps.get(1)?.as_str().parse().ok()?, caps.get(2)?.as_str().parse().ok()?))
}

/// Quotes a remote path, letting a leading `~/` expand to the remote home.
fn remote_path_arg(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

/// File count and byte size of a local tree.
async fn tree_size(root: &Path) -> Result<(u64, u64), RemoteError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .fold((0u64, 0u64), |(files, bytes), entry| {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                (files + 1, bytes + size)
            })
    })
    .await
    .map_err(|e| RemoteError::Io(std::io::Error::other(e)))
}

fn spawn_error(tool: &str, e: std::io::Error) -> RemoteError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RemoteError::ToolNotFound {
            tool: tool.to_string(),
            detail: e.to_string(),
        }
    } else {
        RemoteError::Io(e)
    }
}

fn process_error(tool: &str, e: ProcessError) -> RemoteError {
    match e {
        ProcessError::NotFound { program } => RemoteError::ToolNotFound {
            tool: tool.to_string(),
            detail: format!("{} not found", program),
        },
        ProcessError::Spawn { source, .. } => spawn_error(tool, source),
        ProcessError::Timeout(after) => {
            RemoteError::transient(format!("{} timed out after {:?}", tool, after), None)
        }
        ProcessError::Cancelled => RemoteError::Cancelled,
        ProcessError::Io(e) => RemoteError::Io(e),
    }
}

fn command_error(script: &str, output: &Output) -> RemoteError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    RemoteError::command_failed(
        format!("remote command `{}` failed: {}", script, stderr.trim()),
        output.status.code(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_messages() {
        assert_eq!(rsync_exit_message(23), "partial transfer due to error");
        assert_eq!(rsync_exit_message(255), "ssh connection failed");
        assert_eq!(rsync_exit_message(99), "unknown rsync error");
    }

    #[test]
    fn test_parse_version() {
        let text = "rsync  version 3.2.7  protocol version 31\nCopyright (C) 1996-2022";
        assert_eq!(parse_version(text), Some((3, 2)));
        assert!(parse_version(text).is_some_and(|v| v >= (3, 1)));
        assert!(parse_version("rsync  version 2.6.9  protocol version 29").is_some_and(|v| v < (3, 1)));
    }

    #[test]
    fn test_progress2_line() {
        let mut parser = PushParser::new(true, 10, 2_000_000);
        let event = parser
            .parse(
                "      1,048,576  52%   12.50MB/s    0:00:01 (xfr#3, to-chk=6/10)",
                "/games/HL2",
            )
            .unwrap();
        assert_eq!(
            event,
            PushEvent::Progress {
                bytes_done: 1_048_576,
                bytes_total: 2_000_000,
                files_done: 4,
                files_total: 10,
                rate: Some(12.5 * 1024.0 * 1024.0),
            }
        );
    }

    #[test]
    fn test_per_file_progress_accumulates() {
        let mut parser = PushParser::new(false, 2, 300);
        parser.parse("    100 100%  1.00kB/s    0:00:00 (xfr#1, to-chk=1/2)", "/g");
        let event = parser
            .parse("     50  25%  1.00kB/s    0:00:01", "/g")
            .unwrap();
        assert!(matches!(event, PushEvent::Progress { bytes_done: 150, .. }));
    }

    #[test]
    fn test_file_announcements() {
        let mut parser = PushParser::new(true, 1, 1);
        assert_eq!(
            parser.parse("bin/game.exe", "/games/HL2"),
            Some(PushEvent::FileStarted {
                remote_path: "/games/HL2/bin/game.exe".to_string()
            })
        );
        assert!(parser.parse("sending incremental file list", "/g").is_none());
        assert!(parser.parse("bin/", "/g").is_none());
        assert!(parser.parse("", "/g").is_none());
    }

    #[test]
    fn test_remote_path_quoting() {
        assert_eq!(remote_path_arg("/a b/c"), "'/a b/c'");
        assert_eq!(remote_path_arg("/it's"), r"'/it'\''s'");
        assert_eq!(remote_path_arg("~/x.yaml"), "\"$HOME\"/'x.yaml'");
    }

    #[test]
    fn test_ssh_options_use_key_and_port() {
        let channel = RsyncChannel::new(&TransferConfig::default());
        let endpoint = RemoteEndpoint::new("deck.local", "deck", "/games")
            .with_port(2222)
            .with_private_key("/keys/my key");
        let line = channel.ssh_command_line(&endpoint);
        assert!(line.starts_with("ssh -p 2222 -i '/keys/my key'"));
        assert!(line.contains("-o StrictHostKeyChecking=no"));
        assert!(line.contains("-o ServerAliveCountMax=10"));
    }

    #[tokio::test]
    async fn test_missing_sshpass_is_reported() {
        let config = TransferConfig {
            sshpass_path: PathBuf::from("/nonexistent/sshpass"),
            ..TransferConfig::default()
        };
        let channel = RsyncChannel::new(&config);
        let endpoint = RemoteEndpoint::new("h", "u", "/g").with_password("pw");
        let result = channel.exists(&endpoint, "/g").await;
        assert!(matches!(result, Err(RemoteError::ToolNotFound { .. })));
    }
}
