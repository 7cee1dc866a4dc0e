//! Stage runner trait definition.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::StageError;
use super::handle::ProgressReporter;
use super::types::{StageKind, StageOutput};
use crate::job::InstallJob;
use crate::pipeline::PathLedger;

/// Everything a stage needs while it runs.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job: Arc<InstallJob>,
    pub ledger: PathLedger,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

/// One step of the install pipeline.
///
/// Runners wrap an external tool or channel, report progress through the
/// context and classify their own errors. Transient failures are retried
/// inside `run`; the caller only sees success or a final error.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Whether the stage applies to this job. Skipped stages are not failures.
    fn applies_to(&self, _job: &InstallJob) -> bool {
        true
    }

    /// Checks tools and settings before the pipeline starts.
    ///
    /// Should return [`StageError::Configuration`] for anything missing.
    async fn validate(&self, job: &InstallJob) -> Result<(), StageError>;

    /// Runs the stage to completion.
    ///
    /// Must stop promptly once `ctx.cancel` fires, terminating any process
    /// it spawned, and return [`StageError::Cancelled`].
    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageError>;
}
