//! Transfer stage: moves the staged tree into the install target.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::config::TransferConfig;
use super::error::StageError;
use super::retry::with_retry;
use super::traits::{StageContext, StageRunner};
use super::types::{StageKind, StageOutput};
use crate::job::{InstallJob, InstallTarget};
use crate::pipeline::remove_local_path;
use crate::remote::{remote_join, remote_parent, PushEvent, RemoteChannel, RemoteEndpoint};

/// Raw EXDEV on Linux.
const EXDEV: i32 = 18;

/// One entry of the staged tree, relative to the staging root.
#[derive(Debug, Clone)]
struct StagedEntry {
    relative: PathBuf,
    is_dir: bool,
    size: u64,
}

pub struct TransferStage {
    config: TransferConfig,
    remote: Arc<dyn RemoteChannel>,
}

impl TransferStage {
    pub fn new(config: TransferConfig, remote: Arc<dyn RemoteChannel>) -> Self {
        Self { config, remote }
    }

    async fn transfer_local(&self, ctx: &StageContext, target: &Path) -> Result<StageOutput, StageError> {
        let entries = staged_entries(&ctx.job.staging_dir).await?;
        let total: u64 = entries.iter().map(|e| e.size).sum();
        ctx.progress.set_total(total);
        ctx.progress
            .set_message(format!("Moving files to {}", target.display()));

        // A fresh target is owned entirely by this run.
        let fresh = !fs::try_exists(target).await.unwrap_or(false);
        if fresh {
            ctx.ledger.record_local(target).await?;
            fs::create_dir_all(target).await?;
        }

        let mut files = 0u64;
        let mut done = 0u64;
        for entry in &entries {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let source = ctx.job.staging_dir.join(&entry.relative);
            let destination = target.join(&entry.relative);

            if entry.is_dir {
                if !fs::try_exists(&destination).await.unwrap_or(false) {
                    if !fresh {
                        ctx.ledger.record_local(&destination).await?;
                    }
                    fs::create_dir_all(&destination).await?;
                }
                continue;
            }

            if !fresh {
                ctx.ledger.record_local(&destination).await?;
            }
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).await?;
            }
            self.move_file(ctx, &source, &destination, done).await?;

            files += 1;
            done += entry.size;
            ctx.progress.advance(done);
        }

        remove_local_path(&ctx.job.staging_dir).await?;
        info!("Moved {} file(s) into {}", files, target.display());
        Ok(StageOutput::Transferred {
            files,
            bytes: done,
            destination: target.display().to_string(),
        })
    }

    async fn move_file(
        &self,
        ctx: &StageContext,
        source: &Path,
        destination: &Path,
        base: u64,
    ) -> Result<(), StageError> {
        if try_atomic_move(source, destination).await? {
            return Ok(());
        }
        debug!(
            "Cross-device move, copying {} -> {}",
            source.display(),
            destination.display()
        );
        self.copy_file(ctx, source, destination, base).await?;
        fs::remove_file(source).await?;
        Ok(())
    }

    /// Chunked copy that stops between chunks once cancelled.
    async fn copy_file(
        &self,
        ctx: &StageContext,
        source: &Path,
        destination: &Path,
        base: u64,
    ) -> Result<u64, StageError> {
        let mut reader = File::open(source).await?;
        let mut writer = BufWriter::with_capacity(
            self.config.buffer_size,
            File::create(destination).await?,
        );
        let mut buffer = vec![0u8; self.config.buffer_size.max(4096)];
        let mut copied = 0u64;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).await?;
            copied += read as u64;
            ctx.progress.advance(base + copied);
        }
        writer.flush().await?;
        Ok(copied)
    }

    async fn transfer_remote(
        &self,
        ctx: &StageContext,
        endpoint: &RemoteEndpoint,
        target: &str,
    ) -> Result<StageOutput, StageError> {
        let staging = ctx.job.staging_dir.clone();
        let entries = staged_entries(&staging).await?;
        let total: u64 = entries.iter().map(|e| e.size).sum();
        ctx.progress.set_total(total);
        ctx.progress
            .set_message(format!("Sending files to {}", endpoint.host));

        if self.remote.exists(endpoint, target).await? {
            for entry in &entries {
                let relative = entry.relative.to_string_lossy().replace('\\', "/");
                let destination = remote_join(target, &relative);
                if entry.is_dir && self.remote.exists(endpoint, &destination).await? {
                    continue;
                }
                ctx.ledger.record_remote(destination).await?;
            }
        } else {
            ctx.ledger.record_remote(target).await?;
            if let Some(parent) = remote_parent(target) {
                self.remote.create_dir_all(endpoint, parent).await?;
            }
        }

        let summary = with_retry(&self.config.retry, StageKind::Transfer, &ctx.cancel, |attempt| {
            let (tx, mut rx) = mpsc::channel(64);
            let progress = ctx.progress.clone();
            let cancel = ctx.cancel.clone();
            let staging = staging.as_path();
            async move {
                if attempt > 1 {
                    info!("Resuming transfer to {} (attempt {})", endpoint.host, attempt);
                }
                let forward = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        match event {
                            PushEvent::FileStarted { remote_path } => {
                                progress.set_message(format!("Sending {}", remote_path));
                            }
                            PushEvent::Progress {
                                bytes_done,
                                bytes_total,
                                rate,
                                ..
                            } => {
                                if bytes_total > 0 {
                                    progress.set_total(bytes_total);
                                }
                                progress.advance_with_rate(bytes_done, rate);
                            }
                        }
                    }
                });
                let result = self
                    .remote
                    .push(endpoint, staging, target, tx, cancel)
                    .await;
                if let Err(e) = forward.await {
                    warn!("Transfer progress forwarder ended abnormally: {}", e);
                }
                result.map_err(StageError::from)
            }
        })
        .await?;

        ctx.progress.advance(total.max(summary.bytes));
        remove_local_path(&staging).await?;
        info!(
            "Sent {} file(s) to {}:{}",
            summary.files,
            endpoint.destination(),
            target
        );
        Ok(StageOutput::Transferred {
            files: summary.files,
            bytes: summary.bytes,
            destination: format!("{}:{}", endpoint.destination(), target),
        })
    }
}

#[async_trait]
impl StageRunner for TransferStage {
    fn kind(&self) -> StageKind {
        StageKind::Transfer
    }

    async fn validate(&self, job: &InstallJob) -> Result<(), StageError> {
        if matches!(job.target, InstallTarget::Remote { .. }) {
            self.remote.validate().await?;
        }
        Ok(())
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        let job = ctx.job.clone();
        if !fs::try_exists(&job.staging_dir).await.unwrap_or(false) {
            return Err(StageError::fatal(format!(
                "staging directory missing: {}",
                job.staging_dir.display()
            )));
        }
        match &job.target {
            InstallTarget::Local { dir } => self.transfer_local(&ctx, dir).await,
            InstallTarget::Remote { endpoint, dir } => {
                self.transfer_remote(&ctx, endpoint, dir).await
            }
        }
    }
}

/// Renames `source` onto `destination`; `false` if they are on different devices.
async fn try_atomic_move(source: &Path, destination: &Path) -> io::Result<bool> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(EXDEV) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// The staged tree in sorted order, directories before their contents.
async fn staged_entries(root: &Path) -> Result<Vec<StagedEntry>, StageError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| StageError::fatal(format!("walking staging: {}", e)))?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| StageError::fatal(e.to_string()))?
                .to_path_buf();
            let is_dir = entry.file_type().is_dir();
            let size = if is_dir {
                0
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            };
            entries.push(StagedEntry {
                relative,
                is_dir,
                size,
            });
        }
        Ok(entries)
    })
    .await
    .map_err(|e| StageError::fatal(format!("walking staging: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PathLedger, TrackedPath};
    use crate::stage::ProgressReporter;
    use crate::testing::{fixtures, MockRemoteChannel};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn stage(remote: Arc<MockRemoteChannel>) -> TransferStage {
        TransferStage::new(TransferConfig::default(), remote)
    }

    fn context(job: InstallJob) -> StageContext {
        let job = Arc::new(job);
        let (progress, _rx) = ProgressReporter::channel();
        StageContext {
            ledger: PathLedger::new(&job),
            job,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    fn stage_files(job: &InstallJob) {
        std::fs::create_dir_all(job.staging_dir.join("bin")).unwrap();
        std::fs::write(job.staging_dir.join("bin/game.exe"), b"binary").unwrap();
        std::fs::write(job.staging_dir.join("data.pak"), b"payload!").unwrap();
    }

    fn local_target(job: &InstallJob) -> PathBuf {
        match &job.target {
            InstallTarget::Local { dir } => dir.clone(),
            InstallTarget::Remote { .. } => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_local_fresh_target_records_root() {
        let temp = TempDir::new().unwrap();
        let job = fixtures::local_job("220", temp.path());
        stage_files(&job);
        let target = local_target(&job);
        let ctx = context(job.clone());

        let output = stage(Arc::new(MockRemoteChannel::new()))
            .run(ctx.clone())
            .await
            .unwrap();

        assert!(matches!(output, StageOutput::Transferred { files: 2, bytes: 14, .. }));
        assert_eq!(std::fs::read(target.join("bin/game.exe")).unwrap(), b"binary");
        assert!(!job.staging_dir.exists());
        assert_eq!(ctx.ledger.paths().await, vec![TrackedPath::Local(target)]);
        assert_eq!(ctx.progress.current().bytes_done, 14);
    }

    #[tokio::test]
    async fn test_local_existing_target_records_each_file() {
        let temp = TempDir::new().unwrap();
        let job = fixtures::local_job("220", temp.path());
        stage_files(&job);
        let target = local_target(&job);
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("keep.txt"), b"user file").unwrap();
        let ctx = context(job);

        stage(Arc::new(MockRemoteChannel::new()))
            .run(ctx.clone())
            .await
            .unwrap();

        let paths = ctx.ledger.paths().await;
        assert!(paths.contains(&TrackedPath::Local(target.join("bin"))));
        assert!(paths.contains(&TrackedPath::Local(target.join("data.pak"))));
        assert!(paths.contains(&TrackedPath::Local(target.join("bin/game.exe"))));
        assert!(!paths.contains(&TrackedPath::Local(target.clone())));
        assert!(target.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_local_cancelled_before_start() {
        let temp = TempDir::new().unwrap();
        let job = fixtures::local_job("220", temp.path());
        stage_files(&job);
        let ctx = context(job);
        ctx.cancel.cancel();

        let result = stage(Arc::new(MockRemoteChannel::new())).run(ctx).await;
        assert!(matches!(result, Err(StageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_staging_is_fatal() {
        let temp = TempDir::new().unwrap();
        let job = fixtures::local_job("220", temp.path());
        let result = stage(Arc::new(MockRemoteChannel::new()))
            .run(context(job))
            .await;
        assert!(matches!(result, Err(StageError::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_remote_push_records_root() {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(MockRemoteChannel::rooted(temp.path().join("deck")));
        let job = fixtures::remote_job("220", temp.path());
        stage_files(&job);
        let ctx = context(job.clone());

        let output = stage(remote.clone()).run(ctx.clone()).await.unwrap();

        let InstallTarget::Remote { dir, .. } = &job.target else {
            unreachable!()
        };
        assert!(matches!(output, StageOutput::Transferred { files: 2, .. }));
        assert_eq!(ctx.ledger.paths().await, vec![TrackedPath::Remote(dir.clone())]);
        assert!(remote.local_path(&remote_join(dir, "bin/game.exe")).exists());
        assert!(!job.staging_dir.exists());
    }

    #[tokio::test]
    async fn test_remote_existing_target_records_new_dirs() {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(MockRemoteChannel::rooted(temp.path().join("deck")));
        let job = fixtures::remote_job("220", temp.path());
        stage_files(&job);
        std::fs::create_dir_all(job.staging_dir.join("shared")).unwrap();
        std::fs::write(job.staging_dir.join("shared/common.dat"), b"c").unwrap();
        let InstallTarget::Remote { dir, .. } = job.target.clone() else {
            unreachable!()
        };
        std::fs::create_dir_all(remote.local_path(&remote_join(&dir, "shared"))).unwrap();
        std::fs::write(remote.local_path(&remote_join(&dir, "keep.txt")), b"user").unwrap();
        let ctx = context(job);

        stage(remote.clone()).run(ctx.clone()).await.unwrap();

        let paths = ctx.ledger.paths().await;
        assert!(paths.contains(&TrackedPath::Remote(remote_join(&dir, "bin"))));
        assert!(paths.contains(&TrackedPath::Remote(remote_join(&dir, "bin/game.exe"))));
        assert!(paths.contains(&TrackedPath::Remote(remote_join(&dir, "shared/common.dat"))));
        assert!(!paths.contains(&TrackedPath::Remote(remote_join(&dir, "shared"))));
        assert!(!paths.contains(&TrackedPath::Remote(dir.clone())));
        assert!(remote.local_path(&remote_join(&dir, "keep.txt")).exists());
    }

    #[tokio::test]
    async fn test_remote_transient_failure_is_retried() {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(MockRemoteChannel::rooted(temp.path().join("deck")));
        remote.set_push_failures(1).await;
        let job = fixtures::remote_job("220", temp.path());
        stage_files(&job);

        let stage = TransferStage::new(
            TransferConfig::default().with_retry(crate::stage::RetryConfig::immediate(3)),
            remote.clone(),
        );
        stage.run(context(job)).await.unwrap();
        assert_eq!(remote.push_attempts().await, 2);
    }
}
