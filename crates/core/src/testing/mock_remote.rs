//! Mock remote channel for testing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::remote::{remote_join, PushEvent, PushSummary, RemoteChannel, RemoteEndpoint, RemoteError};

/// Mock implementation of the RemoteChannel trait.
///
/// Remote paths are mapped onto the local filesystem, either as-is or
/// below a root directory, so tests can inspect what a push or a
/// registration left behind.
///
/// # Example
///
/// ```rust,ignore
/// use decklift_core::testing::MockRemoteChannel;
///
/// let remote = MockRemoteChannel::rooted(temp.path().join("deck"));
/// remote.set_push_failures(1).await;
///
/// // ... run a remote transfer ...
/// assert_eq!(remote.push_attempts().await, 2);
/// assert!(remote.local_path("/home/deck/games/Portal/portal.exe").exists());
/// ```
#[derive(Debug, Clone)]
pub struct MockRemoteChannel {
    root: Option<PathBuf>,
    /// Pushes that fail with a transient error before one succeeds.
    push_failures: Arc<RwLock<u32>>,
    /// If set, pushes stop with a fatal error after this fraction of files.
    fail_push_at: Arc<RwLock<Option<f64>>>,
    push_attempts: Arc<RwLock<u32>>,
    removals: Arc<RwLock<Vec<String>>>,
    writes: Arc<RwLock<Vec<String>>>,
}

impl Default for MockRemoteChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteChannel {
    /// Remote paths are used as local paths unchanged.
    pub fn new() -> Self {
        Self {
            root: None,
            push_failures: Arc::new(RwLock::new(0)),
            fail_push_at: Arc::new(RwLock::new(None)),
            push_attempts: Arc::new(RwLock::new(0)),
            removals: Arc::new(RwLock::new(Vec::new())),
            writes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Remote paths live below `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::new()
        }
    }

    /// Local location standing in for a remote path.
    pub fn local_path(&self, remote_path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(remote_path.trim_start_matches('/')),
            None => PathBuf::from(remote_path),
        }
    }

    /// Makes the next `count` pushes fail with a transient error.
    pub async fn set_push_failures(&self, count: u32) {
        *self.push_failures.write().await = count;
    }

    /// Makes every push fail once `fraction` of its files were copied.
    pub async fn set_fail_push_at(&self, fraction: f64) {
        *self.fail_push_at.write().await = Some(fraction.clamp(0.0, 1.0));
    }

    pub async fn push_attempts(&self) -> u32 {
        *self.push_attempts.read().await
    }

    /// Remote paths passed to `remove`, in call order.
    pub async fn recorded_removals(&self) -> Vec<String> {
        self.removals.read().await.clone()
    }

    /// Remote paths passed to `write_file`, in call order.
    pub async fn recorded_writes(&self) -> Vec<String> {
        self.writes.read().await.clone()
    }

    fn files_below(dir: &Path) -> Result<Vec<PathBuf>, RemoteError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| RemoteError::Io(std::io::Error::other(e)))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl RemoteChannel for MockRemoteChannel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn validate(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn push(
        &self,
        _endpoint: &RemoteEndpoint,
        local_dir: &Path,
        remote_dir: &str,
        events: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<PushSummary, RemoteError> {
        *self.push_attempts.write().await += 1;
        {
            let mut failures = self.push_failures.write().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(RemoteError::transient(
                    "rsync: connection unexpectedly closed",
                    Some(12),
                ));
            }
        }

        let files = Self::files_below(local_dir)?;
        let mut sizes = Vec::with_capacity(files.len());
        for file in &files {
            sizes.push(tokio::fs::metadata(file).await?.len());
        }
        let bytes_total: u64 = sizes.iter().sum();
        let files_total = files.len() as u64;
        let stop_after = self
            .fail_push_at
            .read()
            .await
            .map(|fraction| (fraction * files_total as f64).round() as u64);

        let mut summary = PushSummary::default();
        for (file, size) in files.iter().zip(sizes) {
            if cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            if stop_after == Some(summary.files) {
                return Err(RemoteError::command_failed(
                    "rsync: partial transfer due to error (code 23)",
                    Some(23),
                ));
            }

            let relative = file
                .strip_prefix(local_dir)
                .map_err(|e| RemoteError::Io(std::io::Error::other(e)))?
                .to_string_lossy()
                .into_owned();
            let remote_path = remote_join(remote_dir, &relative);
            let _ = events.try_send(PushEvent::FileStarted {
                remote_path: remote_path.clone(),
            });

            let dest = self.local_path(&remote_path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(file, &dest).await?;

            summary.files += 1;
            summary.bytes += size;
            let _ = events.try_send(PushEvent::Progress {
                bytes_done: summary.bytes,
                bytes_total,
                files_done: summary.files,
                files_total,
                rate: None,
            });
        }
        Ok(summary)
    }

    async fn exists(&self, _endpoint: &RemoteEndpoint, remote_path: &str) -> Result<bool, RemoteError> {
        Ok(tokio::fs::try_exists(self.local_path(remote_path)).await?)
    }

    async fn create_dir_all(
        &self,
        _endpoint: &RemoteEndpoint,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        tokio::fs::create_dir_all(self.local_path(remote_path)).await?;
        Ok(())
    }

    async fn remove(&self, _endpoint: &RemoteEndpoint, remote_path: &str) -> Result<(), RemoteError> {
        self.removals.write().await.push(remote_path.to_string());
        let path = self.local_path(remote_path);
        let result = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn read_file(
        &self,
        _endpoint: &RemoteEndpoint,
        remote_path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        match tokio::fs::read(self.local_path(remote_path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(
        &self,
        _endpoint: &RemoteEndpoint,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<(), RemoteError> {
        self.writes.write().await.push(remote_path.to_string());
        let path = self.local_path(remote_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}
