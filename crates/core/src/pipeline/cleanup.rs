//! Removal of partial artifacts after a cancelled or failed run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use super::ledger::TrackedPath;
use crate::metrics;
use crate::remote::{remote_parent, RemoteChannel, RemoteEndpoint};

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Paths that were already gone.
    pub missing: Vec<String>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.removed.is_empty() {
            "No files found to clean up".to_string()
        } else {
            format!("Cleaned up: {}", self.removed.join(", "))
        }
    }
}

/// Removes recorded paths, local and remote.
#[derive(Clone)]
pub struct CleanupController {
    remote: Arc<dyn RemoteChannel>,
}

impl CleanupController {
    pub fn new(remote: Arc<dyn RemoteChannel>) -> Self {
        Self { remote }
    }

    /// Removes `paths` newest first.
    ///
    /// Paths below another recorded path are skipped since their ancestor is
    /// removed recursively. Missing paths are not errors.
    pub async fn cleanup(
        &self,
        paths: &[TrackedPath],
        endpoint: Option<&RemoteEndpoint>,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        let recorded: HashSet<&TrackedPath> = paths.iter().collect();

        for path in paths.iter().rev() {
            if has_recorded_ancestor(path, &recorded) {
                continue;
            }
            match path {
                TrackedPath::Local(local) => self.remove_local(local, &mut report).await,
                TrackedPath::Remote(remote) => {
                    self.remove_remote(remote, endpoint, &mut report).await
                }
            }
        }

        metrics::CLEANUP_PATHS_REMOVED.inc_by(report.removed.len() as u64);
        metrics::CLEANUP_ERRORS.inc_by(report.errors.len() as u64);

        if report.success() {
            info!(
                "Cleanup finished: {} removed, {} already missing",
                report.removed.len(),
                report.missing.len()
            );
        } else {
            warn!("Cleanup finished with {} error(s)", report.errors.len());
        }
        report
    }

    async fn remove_local(&self, path: &Path, report: &mut CleanupReport) {
        let shown = path.display().to_string();
        match remove_local_path(path).await {
            Ok(true) => report.removed.push(shown),
            Ok(false) => report.missing.push(shown),
            Err(e) => {
                warn!("Failed to remove {}: {}", shown, e);
                report
                    .errors
                    .push(format!("Failed to remove {}: {}", shown, e));
            }
        }
    }

    async fn remove_remote(
        &self,
        path: &str,
        endpoint: Option<&RemoteEndpoint>,
        report: &mut CleanupReport,
    ) {
        let Some(endpoint) = endpoint else {
            report
                .errors
                .push(format!("No remote endpoint to remove {}", path));
            return;
        };
        match self.remote.remove(endpoint, path).await {
            Ok(()) => report.removed.push(format!("{}:{}", endpoint.host, path)),
            Err(e) => {
                warn!("Failed to remove {} on {}: {}", path, endpoint, e);
                report
                    .errors
                    .push(format!("Failed to remove {} on {}: {}", path, endpoint.host, e));
            }
        }
    }
}

/// Removes a file or directory tree. Returns `false` if nothing was there.
pub async fn remove_local_path(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn has_recorded_ancestor(path: &TrackedPath, recorded: &HashSet<&TrackedPath>) -> bool {
    match path {
        TrackedPath::Local(local) => local.ancestors().skip(1).any(|ancestor| {
            recorded.contains(&TrackedPath::Local(PathBuf::from(ancestor)))
        }),
        TrackedPath::Remote(remote) => {
            let mut current = remote.as_str();
            while let Some(parent) = remote_parent(current) {
                if recorded.contains(&TrackedPath::Remote(parent.to_string())) {
                    return true;
                }
                if parent == "/" {
                    break;
                }
                current = parent;
            }
            false
        }
    }
}
