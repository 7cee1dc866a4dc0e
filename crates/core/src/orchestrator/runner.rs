//! Install orchestrator implementation.
//!
//! Owns the queue and the state machine. A single dispatcher task takes
//! jobs off the queue one at a time, so at most one pipeline run is ever
//! active.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::types::{FinishedRun, JobPhase, JobStatus, OrchestratorError, OrchestratorStatus};
use crate::config::{Config, LibraryConfig};
use crate::job::{
    CancelOutcome, InstallJob, InstallTarget, JobError, JobId, JobQueue, JobSpec, QueuedJob,
};
use crate::metrics;
use crate::pipeline::{
    discard_journal, load_journal, CleanupController, CleanupReport, PathLedger,
    PipelineStateMachine, RunControl, RunStage, TerminalOutcome, TrackedPath,
};
use crate::progress::{ProgressBus, ProgressSnapshot};
use crate::registrar::{LibraryRegistrar, Registrar};
use crate::remote::{RemoteChannel, RemoteEndpoint, RsyncChannel};
use crate::stage::{DepotDownloadStage, PatchStage, RegisterStage, StageRunner, TransferStage};

/// Finished runs kept for status queries and later cleanup.
pub const MAX_FINISHED_RUNS: usize = 64;

#[derive(Default)]
struct QueueState {
    queue: JobQueue,
    /// Newest last.
    finished: VecDeque<FinishedRun>,
}

impl QueueState {
    fn retain(&mut self, run: FinishedRun) {
        self.finished.push_back(run);
        while self.finished.len() > MAX_FINISHED_RUNS {
            self.finished.pop_front();
        }
    }

    fn finished(&self, id: JobId) -> Option<&FinishedRun> {
        self.finished.iter().rev().find(|run| run.job.id == id)
    }
}

/// State shared with the dispatcher task.
struct Shared {
    machine: PipelineStateMachine,
    registrar: Arc<dyn Registrar>,
    library: LibraryConfig,
    state: Mutex<QueueState>,
    wake: Notify,
}

/// Accepts install jobs and runs them through the pipeline in FIFO order.
pub struct InstallOrchestrator {
    shared: Arc<Shared>,
    default_remote: Option<RemoteEndpoint>,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InstallOrchestrator {
    /// Create a new orchestrator.
    ///
    /// `registrar` should be the one the register stage uses; its planned
    /// artifacts are included in [`InstallOrchestrator::cleanup_cancelled`].
    pub fn new(
        machine: PipelineStateMachine,
        registrar: Arc<dyn Registrar>,
        library: LibraryConfig,
        default_remote: Option<RemoteEndpoint>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                machine,
                registrar,
                library,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
            }),
            default_remote,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            dispatcher: std::sync::Mutex::new(None),
        }
    }

    /// Wires the production stages, rsync channel and library registrar.
    pub fn from_config(config: &Config) -> Self {
        let grace = config.pipeline.cancel_grace();
        let remote: Arc<dyn RemoteChannel> =
            Arc::new(RsyncChannel::new(&config.transfer).with_grace(grace));
        let registrar: Arc<dyn Registrar> = Arc::new(LibraryRegistrar::new(
            config.registration.clone(),
            remote.clone(),
        ));

        let stages: Vec<Arc<dyn StageRunner>> = vec![
            Arc::new(DepotDownloadStage::new(config.download.clone()).with_grace(grace)),
            Arc::new(PatchStage::new(config.patch.clone()).with_grace(grace)),
            Arc::new(TransferStage::new(config.transfer.clone(), remote.clone())),
            Arc::new(RegisterStage::new(
                registrar.clone(),
                config.registration.retry.clone(),
            )),
        ];
        let machine = PipelineStateMachine::new(
            stages,
            CleanupController::new(remote),
            ProgressBus::new(config.pipeline.bus_capacity),
            config.pipeline.clone(),
        );

        Self::new(
            machine,
            registrar,
            config.library.clone(),
            config.remote.clone(),
        )
    }

    pub fn bus(&self) -> &ProgressBus {
        self.shared.machine.bus()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the orchestrator (spawns the dispatcher).
    ///
    /// A run interrupted by a previous process exit is cleaned up first.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!("Starting install orchestrator");
        if let Err(e) = self.recover_interrupted().await {
            error!("Failed to recover interrupted run: {}", e);
        }

        let handle = self.spawn_dispatcher();
        if let Ok(mut slot) = self.dispatcher.lock() {
            *slot = Some(handle);
        }
        info!("Install orchestrator started");
    }

    /// Stop the orchestrator, cancelling the active run and waiting for it.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping install orchestrator");
        {
            // The dispatcher reads the flag under this lock before dequeuing,
            // so nothing can become active after the cancel below.
            let state = self.shared.state.lock().await;
            if let Some(active) = state.queue.active() {
                active.control.cancel();
            }
        }
        let _ = self.shutdown_tx.send(());

        let handle = self.dispatcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatcher task failed: {}", e);
            }
        }
        info!("Install orchestrator stopped");
    }

    fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Dispatcher started");
            loop {
                loop {
                    let next = {
                        let mut state = shared.state.lock().await;
                        if running.load(Ordering::SeqCst) {
                            state.queue.dequeue_next()
                        } else {
                            None
                        }
                    };
                    match next {
                        Some(queued) => Self::run_one(&shared, queued).await,
                        None => break,
                    }
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Dispatcher received shutdown signal");
                        break;
                    }
                    _ = shared.wake.notified() => {}
                }
            }
            info!("Dispatcher stopped");
        })
    }

    async fn run_one(shared: &Shared, queued: QueuedJob) {
        let QueuedJob {
            job,
            control,
            enqueued_at,
        } = queued;
        let ledger = PathLedger::journaled(&job, &shared.library.state_dir);

        let (outcome, terminal) = shared
            .machine
            .execute(job.clone(), &control, ledger.clone())
            .await;
        let partial_paths = ledger.paths().await;

        // The slot is freed before the terminal record goes out, so a
        // subscriber that re-enqueues on it is never seen as a duplicate.
        let mut state = shared.state.lock().await;
        state.queue.finish_active(job.id);
        state.retain(FinishedRun {
            job,
            outcome,
            partial_paths,
            latest: control.latest(),
            enqueued_at,
            finished_at: Utc::now(),
        });
        if let Some(snapshot) = terminal {
            shared.machine.bus().publish(snapshot);
        }
    }

    /// Cleans up after a run the previous process never finished.
    ///
    /// The run is reported on the bus as failed. Returns the cleanup
    /// report, or `None` when no journal was left behind.
    pub async fn recover_interrupted(&self) -> Result<Option<CleanupReport>, OrchestratorError> {
        let state_dir = &self.shared.library.state_dir;
        let Some(journal) = load_journal(state_dir).await? else {
            return Ok(None);
        };

        warn!(
            job_id = %journal.job_id,
            "Found interrupted install of app {} with {} recorded path(s)",
            journal.app_id,
            journal.paths.len()
        );
        let report = self
            .shared
            .machine
            .cleanup_controller()
            .cleanup(&journal.paths, journal.remote_endpoint.as_ref())
            .await;
        discard_journal(state_dir).await?;

        metrics::INSTALLS_FAILED.with_label_values(&["restart"]).inc();
        self.bus().publish(ProgressSnapshot {
            job_id: journal.job_id,
            app_id: journal.app_id.clone(),
            stage: RunStage::Failed,
            bytes_done: 0,
            bytes_total: 0,
            rate_estimate: None,
            message: format!(
                "Install of app {} was interrupted by restart. {}",
                journal.app_id,
                report.summary()
            ),
            failed_stage: None,
            timestamp: Utc::now(),
        });
        Ok(Some(report))
    }

    /// Resolves and queues an install.
    pub async fn enqueue_install(&self, spec: JobSpec) -> Result<JobId, OrchestratorError> {
        let job = InstallJob::from_spec(
            spec,
            &self.shared.library,
            self.default_remote.as_ref(),
        )?;
        let control = RunControl::new();
        let snapshot = ProgressSnapshot::new(
            &job,
            RunStage::Queued,
            format!("Queued {}", job.display_name),
        );

        let id = self
            .shared
            .state
            .lock()
            .await
            .queue
            .enqueue(job, control.clone())?;
        info!(job_id = %id, app_id = %snapshot.app_id, "Queued install");

        control.set_latest(snapshot.clone());
        self.bus().publish(snapshot);
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancels a queued or running job. Finished jobs are left alone.
    pub async fn cancel_install(&self, id: JobId) -> Result<(), OrchestratorError> {
        let mut state = self.shared.state.lock().await;
        match state.queue.cancel(id) {
            CancelOutcome::Signalled => {
                info!(job_id = %id, "Cancellation requested");
                Ok(())
            }
            CancelOutcome::Removed(queued) => {
                let outcome = TerminalOutcome::Cancelled {
                    message: format!(
                        "Install of {} cancelled before it started",
                        queued.job.display_name
                    ),
                    cleanup: CleanupReport::default(),
                };
                metrics::INSTALLS_CANCELLED.inc();

                let snapshot =
                    ProgressSnapshot::new(&queued.job, RunStage::Cancelled, outcome.message());
                queued.control.set_latest(snapshot.clone());
                info!(job_id = %id, "Removed queued install");

                state.retain(FinishedRun {
                    latest: queued.control.latest(),
                    job: queued.job,
                    outcome,
                    partial_paths: Vec::new(),
                    enqueued_at: queued.enqueued_at,
                    finished_at: Utc::now(),
                });
                self.bus().publish(snapshot);
                Ok(())
            }
            CancelOutcome::NotFound if state.finished(id).is_some() => Ok(()),
            CancelOutcome::NotFound => Err(JobError::NotFound(id).into()),
        }
    }

    /// Holds a queued or running job at its next stage boundary.
    pub async fn pause_install(&self, id: JobId) -> Result<(), OrchestratorError> {
        self.pending_control(id).await?.pause();
        info!(job_id = %id, "Pause requested");
        Ok(())
    }

    pub async fn resume_install(&self, id: JobId) -> Result<(), OrchestratorError> {
        self.pending_control(id).await?.resume();
        info!(job_id = %id, "Resume requested");
        Ok(())
    }

    async fn pending_control(&self, id: JobId) -> Result<RunControl, OrchestratorError> {
        let state = self.shared.state.lock().await;
        if let Some(queued) = state.queue.get(id) {
            return Ok(queued.control.clone());
        }
        if state.finished(id).is_some() {
            return Err(JobError::AlreadyFinished(id).into());
        }
        Err(JobError::NotFound(id).into())
    }

    /// Removes whatever a cancelled or failed job may have left behind.
    ///
    /// Covers the run's remaining ledger, its staging and target
    /// directories and the registrar's artifacts.
    pub async fn cleanup_cancelled(&self, id: JobId) -> Result<CleanupReport, OrchestratorError> {
        let (job, mut paths) = {
            let state = self.shared.state.lock().await;
            if state.queue.get(id).is_some() {
                return Err(JobError::NotTerminal(id).into());
            }
            let run = state.finished(id).ok_or(JobError::NotFound(id))?;
            if run.outcome.is_success() {
                return Err(JobError::NotCleanable(id).into());
            }
            (run.job.clone(), run.partial_paths.clone())
        };

        let target = match &job.target {
            InstallTarget::Local { dir } => TrackedPath::Local(dir.clone()),
            InstallTarget::Remote { dir, .. } => TrackedPath::Remote(dir.clone()),
        };
        let extra = std::iter::once(TrackedPath::Local(job.staging_dir.clone()))
            .chain(std::iter::once(target))
            .chain(self.shared.registrar.planned_artifacts(&job));
        for path in extra {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        info!(job_id = %id, "Cleaning up {} path(s)", paths.len());
        let report = self
            .shared
            .machine
            .cleanup_controller()
            .cleanup(&paths, job.remote_endpoint())
            .await;

        let mut state = self.shared.state.lock().await;
        if let Some(run) = state.finished.iter_mut().find(|run| run.job.id == id) {
            run.partial_paths.clear();
        }
        Ok(report)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.bus().subscribe()
    }

    /// Get current orchestrator status.
    pub async fn status(&self) -> OrchestratorStatus {
        let state = self.shared.state.lock().await;
        OrchestratorStatus {
            running: self.is_running(),
            active: state
                .queue
                .active()
                .map(|q| JobStatus::pending(q, JobPhase::Running)),
            queued: state
                .queue
                .pending()
                .map(|q| JobStatus::pending(q, JobPhase::Queued))
                .collect(),
            finished: state.finished.iter().rev().map(FinishedRun::status).collect(),
        }
    }

    /// Status of one job, if it is known.
    pub async fn job(&self, id: JobId) -> Option<JobStatus> {
        let state = self.shared.state.lock().await;
        if let Some(active) = state.queue.active().filter(|q| q.id() == id) {
            return Some(JobStatus::pending(active, JobPhase::Running));
        }
        if let Some(queued) = state.queue.get(id) {
            return Some(JobStatus::pending(queued, JobPhase::Queued));
        }
        state.finished(id).map(FinishedRun::status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Topology;
    use crate::pipeline::PipelineConfig;
    use crate::stage::{StageError, StageKind};
    use crate::testing::{fixtures, MockRegistrar, MockRemoteChannel, MockStage};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn orchestrator(root: &Path, stages: Vec<MockStage>) -> InstallOrchestrator {
        let stages = stages
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn StageRunner>)
            .collect();
        let machine = PipelineStateMachine::new(
            stages,
            CleanupController::new(Arc::new(MockRemoteChannel::new())),
            ProgressBus::new(256),
            PipelineConfig::default()
                .with_poll_interval(10)
                .with_cancel_grace(1),
        );
        InstallOrchestrator::new(
            machine,
            Arc::new(MockRegistrar::new()),
            fixtures::library(root),
            None,
        )
    }

    fn spec(app_id: &str, root: &Path) -> JobSpec {
        fixtures::job_spec(app_id, root, Topology::Local)
    }

    async fn wait_terminal(
        rx: &mut broadcast::Receiver<ProgressSnapshot>,
        id: JobId,
    ) -> ProgressSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.recv().await.unwrap();
                if snapshot.job_id == id && snapshot.is_terminal() {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_emits_queued_snapshot() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), vec![MockStage::new(StageKind::Download)]);
        let mut rx = orchestrator.subscribe();

        let id = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.job_id, id);
        assert_eq!(snapshot.stage, RunStage::Queued);
        let status = orchestrator.job(id).await.unwrap();
        assert_eq!(status.phase, JobPhase::Queued);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_rejected() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), vec![]);
        orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();

        let dup = orchestrator.enqueue_install(spec("220", temp.path())).await;
        assert!(matches!(
            dup,
            Err(OrchestratorError::Job(JobError::Duplicate { .. }))
        ));

        let remote = spec("400", temp.path());
        let invalid = JobSpec {
            topology: Topology::Remote,
            ..remote
        };
        assert!(matches!(
            orchestrator.enqueue_install(invalid).await,
            Err(OrchestratorError::Job(JobError::InvalidJob(_)))
        ));
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), vec![MockStage::new(StageKind::Download)]);
        let mut rx = orchestrator.subscribe();
        let first = orchestrator.enqueue_install(spec("10", temp.path())).await.unwrap();
        let second = orchestrator.enqueue_install(spec("20", temp.path())).await.unwrap();

        orchestrator.start().await;
        let mut terminals = Vec::new();
        while terminals.len() < 2 {
            let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if snapshot.is_terminal() {
                terminals.push(snapshot.job_id);
            }
        }
        orchestrator.stop().await;

        assert_eq!(terminals, vec![first, second]);
        let status = orchestrator.status().await;
        assert_eq!(status.finished.len(), 2);
        assert_eq!(status.finished[0].job_id, second);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_runs() {
        let temp = TempDir::new().unwrap();
        let download = MockStage::new(StageKind::Download);
        let orchestrator = orchestrator(temp.path(), vec![download.clone()]);
        let mut rx = orchestrator.subscribe();
        let id = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();

        orchestrator.cancel_install(id).await.unwrap();
        let terminal = wait_terminal(&mut rx, id).await;
        assert_eq!(terminal.stage, RunStage::Cancelled);

        orchestrator.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.stop().await;
        assert_eq!(download.runs(), 0);
        assert_eq!(orchestrator.job(id).await.unwrap().phase, JobPhase::Finished);
    }

    #[tokio::test]
    async fn test_cancel_active_job() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            temp.path(),
            vec![MockStage::new(StageKind::Download).hanging(30, 100)],
        );
        let mut rx = orchestrator.subscribe();
        orchestrator.start().await;
        let id = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.cancel_install(id).await.unwrap();
        let terminal = wait_terminal(&mut rx, id).await;
        orchestrator.stop().await;

        assert_eq!(terminal.stage, RunStage::Cancelled);
        let outcome = orchestrator.job(id).await.unwrap().outcome.unwrap();
        assert_eq!(outcome.run_stage(), RunStage::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reenqueue_on_terminal_record_is_accepted() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), vec![MockStage::new(StageKind::Download)]);
        let mut rx = orchestrator.subscribe();
        orchestrator.start().await;

        let mut id = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();
        for _ in 0..20 {
            wait_terminal(&mut rx, id).await;
            let next = orchestrator
                .enqueue_install(spec("220", temp.path()))
                .await
                .unwrap();

            assert_eq!(
                orchestrator.job(id).await.unwrap().phase,
                JobPhase::Finished
            );
            id = next;
        }
        wait_terminal(&mut rx, id).await;
        orchestrator.stop().await;

        let status = orchestrator.status().await;
        assert!(status.active.is_none());
        assert_eq!(status.finished.len(), 21);
        assert_eq!(status.finished[0].job_id, id);
    }

    #[tokio::test]
    async fn test_stop_leaves_queued_jobs_unstarted() {
        let temp = TempDir::new().unwrap();
        let download = MockStage::new(StageKind::Download).hanging(30, 100);
        let orchestrator = orchestrator(temp.path(), vec![download.clone()]);
        let mut rx = orchestrator.subscribe();
        orchestrator.start().await;
        let first = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();
        let second = orchestrator.enqueue_install(spec("330", temp.path())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.stop().await;

        let terminal = wait_terminal(&mut rx, first).await;
        assert_eq!(terminal.stage, RunStage::Cancelled);
        assert_eq!(download.runs(), 1);
        assert_eq!(
            orchestrator.job(second).await.unwrap().phase,
            JobPhase::Queued
        );
        assert!(orchestrator.status().await.active.is_none());
    }

    #[tokio::test]
    async fn test_pause_and_resume_unknown_or_finished() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), vec![]);
        assert!(matches!(
            orchestrator.pause_install(JobId::new()).await,
            Err(OrchestratorError::Job(JobError::NotFound(_)))
        ));

        let id = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();
        orchestrator.pause_install(id).await.unwrap();
        assert!(orchestrator.job(id).await.unwrap().paused);
        orchestrator.resume_install(id).await.unwrap();
        assert!(!orchestrator.job(id).await.unwrap().paused);

        orchestrator.cancel_install(id).await.unwrap();
        assert!(matches!(
            orchestrator.resume_install(id).await,
            Err(OrchestratorError::Job(JobError::AlreadyFinished(_)))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_cancelled_rules() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            temp.path(),
            vec![MockStage::new(StageKind::Transfer).failing(StageError::fatal("disk full"))],
        );
        let mut rx = orchestrator.subscribe();

        assert!(matches!(
            orchestrator.cleanup_cancelled(JobId::new()).await,
            Err(OrchestratorError::Job(JobError::NotFound(_)))
        ));

        let id = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();
        assert!(matches!(
            orchestrator.cleanup_cancelled(id).await,
            Err(OrchestratorError::Job(JobError::NotTerminal(_)))
        ));

        orchestrator.start().await;
        wait_terminal(&mut rx, id).await;
        orchestrator.stop().await;

        let job = orchestrator.job(id).await.unwrap();
        let staging = temp.path().join("staging/install_220");
        std::fs::create_dir_all(&staging).unwrap();
        let report = orchestrator.cleanup_cancelled(job.job_id).await.unwrap();
        assert!(report.removed.contains(&staging.display().to_string()));
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_successful_job_is_not_cleanable() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), vec![MockStage::new(StageKind::Download)]);
        let mut rx = orchestrator.subscribe();
        orchestrator.start().await;
        let id = orchestrator.enqueue_install(spec("220", temp.path())).await.unwrap();
        wait_terminal(&mut rx, id).await;
        orchestrator.stop().await;

        assert!(matches!(
            orchestrator.cleanup_cancelled(id).await,
            Err(OrchestratorError::Job(JobError::NotCleanable(_)))
        ));
    }

    #[tokio::test]
    async fn test_recovers_interrupted_run() {
        let temp = TempDir::new().unwrap();
        let job = fixtures::local_job("220", temp.path());
        let ledger = PathLedger::journaled(&job, &temp.path().join("state"));
        std::fs::create_dir_all(&job.staging_dir).unwrap();
        ledger.record_local(job.staging_dir.clone()).await.unwrap();

        let orchestrator = orchestrator(temp.path(), vec![]);
        let mut rx = orchestrator.subscribe();
        orchestrator.start().await;
        orchestrator.stop().await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.job_id, job.id);
        assert_eq!(snapshot.stage, RunStage::Failed);
        assert!(snapshot.message.contains("interrupted by restart"));
        assert!(!job.staging_dir.exists());
        assert!(load_journal(&temp.path().join("state")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_runs_are_capped() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(temp.path(), vec![]);
        for i in 0..(MAX_FINISHED_RUNS + 3) {
            let id = orchestrator
                .enqueue_install(spec(&format!("{}", 1000 + i), temp.path()))
                .await
                .unwrap();
            orchestrator.cancel_install(id).await.unwrap();
        }
        assert_eq!(orchestrator.status().await.finished.len(), MAX_FINISHED_RUNS);
    }
}
