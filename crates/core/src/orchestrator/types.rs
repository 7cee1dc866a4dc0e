//! Types for the install orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::job::{InstallJob, JobError, JobId, QueuedJob, Topology};
use crate::pipeline::{TerminalOutcome, TrackedPath};
use crate::progress::ProgressSnapshot;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Running,
    Finished,
}

/// Status of one job as seen by callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub app_id: String,
    pub display_name: String,
    pub topology: Topology,
    pub phase: JobPhase,
    pub paused: bool,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<ProgressSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TerminalOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub(crate) fn pending(queued: &QueuedJob, phase: JobPhase) -> Self {
        Self {
            job_id: queued.id(),
            app_id: queued.job.app_id.clone(),
            display_name: queued.job.display_name.clone(),
            topology: queued.job.topology(),
            phase,
            paused: queued.control.is_paused(),
            enqueued_at: queued.enqueued_at,
            latest: queued.control.latest(),
            outcome: None,
            finished_at: None,
        }
    }
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<JobStatus>,
    pub queued: Vec<JobStatus>,
    /// Most recent first.
    pub finished: Vec<JobStatus>,
}

/// A run that reached a terminal state.
#[derive(Debug, Clone)]
pub struct FinishedRun {
    pub job: Arc<InstallJob>,
    pub outcome: TerminalOutcome,
    /// The ledger as the run left it; empty after success.
    pub partial_paths: Vec<TrackedPath>,
    pub latest: Option<ProgressSnapshot>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FinishedRun {
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job.id,
            app_id: self.job.app_id.clone(),
            display_name: self.job.display_name.clone(),
            topology: self.job.topology(),
            phase: JobPhase::Finished,
            paused: false,
            enqueued_at: self.enqueued_at,
            latest: self.latest.clone(),
            outcome: Some(self.outcome.clone()),
            finished_at: Some(self.finished_at),
        }
    }
}
