//! Drives one job through its stages.

use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cleanup::CleanupController;
use super::config::PipelineConfig;
use super::control::RunControl;
use super::emitter::RunEmitter;
use super::ledger::PathLedger;
use super::types::{RunStage, TerminalOutcome};
use crate::job::InstallJob;
use crate::metrics;
use crate::progress::{ProgressBus, ProgressSnapshot};
use crate::stage::{StageError, StageHandle, StageKind, StageOutput, StageRunner};

/// How the stage loop stopped early.
enum Abort {
    Cancelled,
    Failed { stage: StageKind, reason: String },
}

/// Runs install jobs one at a time through download, patch, transfer and
/// register.
///
/// The machine is topology-agnostic: each stage decides what a job's
/// target means for it. It only branches on whether a stage succeeded,
/// failed, or was cancelled.
pub struct PipelineStateMachine {
    stages: Vec<Arc<dyn StageRunner>>,
    cleanup: CleanupController,
    bus: ProgressBus,
    config: PipelineConfig,
}

impl PipelineStateMachine {
    /// Stages are ordered by kind regardless of the order given.
    pub fn new(
        mut stages: Vec<Arc<dyn StageRunner>>,
        cleanup: CleanupController,
        bus: ProgressBus,
        config: PipelineConfig,
    ) -> Self {
        stages.sort_by_key(|stage| stage.kind());
        Self {
            stages,
            cleanup,
            bus,
            config,
        }
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    pub fn cleanup_controller(&self) -> &CleanupController {
        &self.cleanup
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Arc<dyn StageRunner>] {
        &self.stages
    }

    /// Checks every stage that applies to `job`.
    pub async fn validate(&self, job: &InstallJob) -> Result<(), (StageKind, StageError)> {
        for stage in self.stages.iter().filter(|s| s.applies_to(job)) {
            stage.validate(job).await.map_err(|e| (stage.kind(), e))?;
        }
        Ok(())
    }

    /// Runs `job` to a terminal outcome and publishes the terminal record.
    ///
    /// Cancelled and failed runs are cleaned up before this returns. The
    /// ledger is promoted on success and closed otherwise.
    pub async fn run(
        &self,
        job: Arc<InstallJob>,
        control: &RunControl,
        ledger: PathLedger,
    ) -> TerminalOutcome {
        let (outcome, terminal) = self.execute(job, control, ledger).await;
        if let Some(snapshot) = terminal {
            self.bus.publish(snapshot);
        }
        outcome
    }

    /// Like [`PipelineStateMachine::run`], but hands back the terminal
    /// record instead of publishing it.
    ///
    /// Callers that track job state publish the record once that state
    /// says the job is finished.
    pub async fn execute(
        &self,
        job: Arc<InstallJob>,
        control: &RunControl,
        ledger: PathLedger,
    ) -> (TerminalOutcome, Option<ProgressSnapshot>) {
        metrics::INSTALLS_STARTED.inc();
        let mut emitter = RunEmitter::new(
            job.clone(),
            self.bus.clone(),
            control.clone(),
            self.config.emit_interval(),
        );
        info!(job_id = %job.id, app_id = %job.app_id, "Starting install of {}", job.display_name);

        if let Err((stage, error)) = self.validate(&job).await {
            warn!(job_id = %job.id, "{} stage not ready: {}", stage, error);
            let outcome = self
                .abort(
                    &job,
                    &ledger,
                    Abort::Failed {
                        stage,
                        reason: error.to_string(),
                    },
                )
                .await;
            let terminal = emitter.terminal(&outcome);
            return (outcome, terminal);
        }

        let outcome = match self.run_stages(&job, control, &ledger, &mut emitter).await {
            Ok(warnings) => {
                if let Err(e) = ledger.promote().await {
                    warn!(job_id = %job.id, "Failed to clear run journal: {}", e);
                }
                metrics::INSTALLS_COMPLETED.inc();
                TerminalOutcome::Success {
                    message: format!("Installed {}", job.display_name),
                    warnings,
                }
            }
            Err(abort) => self.abort(&job, &ledger, abort).await,
        };

        info!(job_id = %job.id, "{}", outcome.message());
        let terminal = emitter.terminal(&outcome);
        (outcome, terminal)
    }

    async fn run_stages(
        &self,
        job: &Arc<InstallJob>,
        control: &RunControl,
        ledger: &PathLedger,
        emitter: &mut RunEmitter,
    ) -> Result<Vec<String>, Abort> {
        let mut warnings = Vec::new();

        for runner in &self.stages {
            let kind = runner.kind();
            if control.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            if control.is_paused() {
                emitter.notice(format!("Paused before {}", kind.as_str()));
                if !control.wait_while_paused().await {
                    return Err(Abort::Cancelled);
                }
                emitter.notice("Resumed");
            }
            if !runner.applies_to(job) {
                debug!(job_id = %job.id, "Skipping {} stage", kind);
                continue;
            }

            emitter.enter(RunStage::from(kind), start_message(kind, job));
            let started = Instant::now();
            let result = self.drive(runner.clone(), job, control, ledger, emitter).await;

            let label = match &result {
                Ok(_) => "success",
                Err(StageError::Cancelled) => "cancelled",
                Err(_) => "failed",
            };
            metrics::STAGE_DURATION
                .with_label_values(&[kind.as_str(), label])
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(output) => {
                    debug!(job_id = %job.id, "{} stage: {}", kind, output.summary());
                    if let Some(warning) = output.warning() {
                        warn!(job_id = %job.id, "{}", warning);
                        warnings.push(warning);
                    }
                }
                Err(StageError::Cancelled) => return Err(Abort::Cancelled),
                Err(_) if control.is_cancelled() => return Err(Abort::Cancelled),
                Err(error) => {
                    return Err(Abort::Failed {
                        stage: kind,
                        reason: error.to_string(),
                    })
                }
            }

            // A cancel that raced with a successful stage still wins.
            if control.is_cancelled() {
                return Err(Abort::Cancelled);
            }
        }
        Ok(warnings)
    }

    /// Starts one stage and polls it until it ends or is cancelled.
    async fn drive(
        &self,
        runner: Arc<dyn StageRunner>,
        job: &Arc<InstallJob>,
        control: &RunControl,
        ledger: &PathLedger,
        emitter: &mut RunEmitter,
    ) -> Result<StageOutput, StageError> {
        let mut handle = StageHandle::start(runner, job.clone(), ledger.clone(), control.token());
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = handle.join() => {
                    emitter.progress(&handle.poll_progress());
                    return result;
                }
                _ = control.cancelled() => {
                    info!(job_id = %job.id, "Cancelling {} stage", handle.kind());
                    handle.cancel();
                    return handle.finish_within(self.config.cancel_grace()).await;
                }
                _ = ticker.tick() => {
                    emitter.progress(&handle.poll_progress());
                }
            }
        }
    }

    async fn abort(&self, job: &InstallJob, ledger: &PathLedger, abort: Abort) -> TerminalOutcome {
        let paths = ledger.paths().await;
        let cleanup = self.cleanup.cleanup(&paths, job.remote_endpoint()).await;
        if let Err(e) = ledger.close().await {
            warn!(job_id = %job.id, "Failed to remove run journal: {}", e);
        }

        match abort {
            Abort::Cancelled => {
                metrics::INSTALLS_CANCELLED.inc();
                TerminalOutcome::Cancelled {
                    message: format!(
                        "Install of {} cancelled. {}",
                        job.display_name,
                        cleanup.summary()
                    ),
                    cleanup,
                }
            }
            Abort::Failed { stage, reason } => {
                metrics::INSTALLS_FAILED
                    .with_label_values(&[stage.as_str()])
                    .inc();
                TerminalOutcome::Failed {
                    stage: Some(stage),
                    reason,
                    cleanup,
                }
            }
        }
    }
}

fn start_message(kind: StageKind, job: &InstallJob) -> String {
    match kind {
        StageKind::Download => format!(
            "Downloading {} ({} depot(s))",
            job.display_name,
            job.depot_items.len()
        ),
        StageKind::Patch => format!("Patching {}", job.display_name),
        StageKind::Transfer => format!("Transferring to {}", job.target.display()),
        StageKind::Register => format!("Registering {}", job.display_name),
    }
}
