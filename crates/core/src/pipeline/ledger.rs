//! Append-only record of every location a run has written to.
//!
//! Stages record a path before they write to it. The ledger is optionally
//! mirrored to a JSON journal so a restarted process can still clean up
//! after a run it lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::job::{InstallJob, JobId, Topology};
use crate::remote::RemoteEndpoint;

/// File name of the active-run journal inside the state directory.
pub const JOURNAL_FILE: &str = "active_run.json";

/// A location written by a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "location", content = "path", rename_all = "snake_case")]
pub enum TrackedPath {
    Local(PathBuf),
    /// A path on the job's remote endpoint.
    Remote(String),
}

impl TrackedPath {
    pub fn display(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Remote(path) => format!("remote:{}", path),
        }
    }
}

/// Persisted form of a run's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJournal {
    pub job_id: JobId,
    pub app_id: String,
    pub topology: Topology,
    #[serde(default)]
    pub remote_endpoint: Option<RemoteEndpoint>,
    pub started_at: DateTime<Utc>,
    pub paths: Vec<TrackedPath>,
}

#[derive(Debug)]
struct LedgerState {
    journal: RunJournal,
    seen: HashSet<TrackedPath>,
    journal_path: Option<PathBuf>,
}

/// Shared handle to a run's ledger.
#[derive(Debug, Clone)]
pub struct PathLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl PathLedger {
    /// A ledger that lives only in memory.
    pub fn new(job: &InstallJob) -> Self {
        Self::build(job, None)
    }

    /// A ledger mirrored to `<state_dir>/active_run.json`.
    pub fn journaled(job: &InstallJob, state_dir: &Path) -> Self {
        Self::build(job, Some(state_dir.join(JOURNAL_FILE)))
    }

    fn build(job: &InstallJob, journal_path: Option<PathBuf>) -> Self {
        let journal = RunJournal {
            job_id: job.id,
            app_id: job.app_id.clone(),
            topology: job.topology(),
            remote_endpoint: job.remote_endpoint().cloned(),
            started_at: Utc::now(),
            paths: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                journal,
                seen: HashSet::new(),
                journal_path,
            })),
        }
    }

    /// Records a path. Already-recorded paths are ignored.
    pub async fn record(&self, path: TrackedPath) -> io::Result<()> {
        let mut state = self.state.lock().await;
        if !state.seen.insert(path.clone()) {
            return Ok(());
        }
        debug!("Recording {}", path.display());
        state.journal.paths.push(path);

        if let Some(journal_path) = &state.journal_path {
            write_journal(journal_path, &state.journal).await?;
        }
        Ok(())
    }

    pub async fn record_local(&self, path: impl Into<PathBuf>) -> io::Result<()> {
        self.record(TrackedPath::Local(path.into())).await
    }

    pub async fn record_remote(&self, path: impl Into<String>) -> io::Result<()> {
        self.record(TrackedPath::Remote(path.into())).await
    }

    /// Paths in record order.
    pub async fn paths(&self) -> Vec<TrackedPath> {
        self.state.lock().await.journal.paths.clone()
    }

    pub async fn contains(&self, path: &TrackedPath) -> bool {
        self.state.lock().await.seen.contains(path)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.journal.paths.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Marks everything written as permanent: the list is emptied and the
    /// journal removed.
    pub async fn promote(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        state.journal.paths.clear();
        state.seen.clear();
        remove_journal(state.journal_path.as_deref()).await
    }

    /// Removes the journal but keeps the in-memory list.
    pub async fn close(&self) -> io::Result<()> {
        let state = self.state.lock().await;
        remove_journal(state.journal_path.as_deref()).await
    }
}

/// Reads a journal left behind by an interrupted run.
pub async fn load_journal(state_dir: &Path) -> io::Result<Option<RunJournal>> {
    let path = state_dir.join(JOURNAL_FILE);
    match fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletes the journal in `state_dir`, if any.
pub async fn discard_journal(state_dir: &Path) -> io::Result<()> {
    remove_journal(Some(&state_dir.join(JOURNAL_FILE))).await
}

async fn write_journal(path: &Path, journal: &RunJournal) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(journal).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

async fn remove_journal(path: Option<&Path>) -> io::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
