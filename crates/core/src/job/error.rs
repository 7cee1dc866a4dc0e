//! Error types for job submission and control.

use thiserror::Error;

use super::types::JobId;

#[derive(Debug, Error)]
pub enum JobError {
    /// The spec violates a job invariant.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Another job for the same app is queued or running.
    #[error("An install for app {app_id} is already queued or running ({existing})")]
    Duplicate { app_id: String, existing: JobId },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The operation needs a job that already finished.
    #[error("Job {0} has not finished yet")]
    NotTerminal(JobId),

    /// The operation needs a job that is still queued or running.
    #[error("Job {0} has already finished")]
    AlreadyFinished(JobId),

    /// The operation needs a job that was cancelled or failed.
    #[error("Job {0} completed successfully")]
    NotCleanable(JobId),
}

impl JobError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidJob(message.into())
    }
}
