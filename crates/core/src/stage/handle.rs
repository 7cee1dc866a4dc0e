//! Running stages: progress reporting and the handle the state machine drives.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error::StageError;
use super::traits::{StageContext, StageRunner};
use super::types::{StageKind, StageOutput, StageProgress};
use crate::job::InstallJob;
use crate::pipeline::PathLedger;
use crate::progress::SpeedTracker;

/// Write side of a stage's progress.
///
/// `bytes_done` never decreases; a lower value keeps the previous one.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<StageProgress>>,
    speed: Arc<Mutex<SpeedTracker>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<StageProgress>) {
        let (tx, rx) = watch::channel(StageProgress::default());
        (
            Self {
                tx: Arc::new(tx),
                speed: Arc::new(Mutex::new(SpeedTracker::default())),
            },
            rx,
        )
    }

    pub fn set_total(&self, bytes_total: u64) {
        self.tx.send_modify(|p| p.bytes_total = bytes_total);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|p| p.message = message);
    }

    /// Updates the byte counter, estimating the rate from recent samples.
    pub fn advance(&self, bytes_done: u64) {
        let rate = self
            .speed
            .lock()
            .ok()
            .and_then(|mut speed| speed.record(bytes_done, Instant::now()));
        self.tx.send_modify(|p| {
            p.bytes_done = p.bytes_done.max(bytes_done);
            if rate.is_some() {
                p.rate = rate;
            }
        });
    }

    /// Updates the byte counter with a rate reported by the tool itself.
    pub fn advance_with_rate(&self, bytes_done: u64, rate: Option<f64>) {
        match rate {
            Some(rate) => self.tx.send_modify(|p| {
                p.bytes_done = p.bytes_done.max(bytes_done);
                p.rate = Some(rate);
            }),
            None => self.advance(bytes_done),
        }
    }

    pub fn current(&self) -> StageProgress {
        self.tx.borrow().clone()
    }
}

/// A stage started on its own task.
pub struct StageHandle {
    kind: StageKind,
    progress: watch::Receiver<StageProgress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<StageOutput, StageError>>,
}

impl StageHandle {
    /// Spawns `runner` for `job`. The stage is cancelled along with `parent`.
    pub fn start(
        runner: Arc<dyn StageRunner>,
        job: Arc<InstallJob>,
        ledger: PathLedger,
        parent: &CancellationToken,
    ) -> Self {
        let kind = runner.kind();
        let (reporter, progress) = ProgressReporter::channel();
        let cancel = parent.child_token();
        let ctx = StageContext {
            job,
            ledger,
            progress: reporter,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(async move { runner.run(ctx).await });

        Self {
            kind,
            progress,
            cancel,
            task,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Latest progress without waiting.
    pub fn poll_progress(&self) -> StageProgress {
        self.progress.borrow().clone()
    }

    /// Asks the stage to stop. Best-effort; see [`StageHandle::finish_within`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the stage. Safe to use in `select!`; dropping the future
    /// leaves the stage running. Must not be awaited again once it resolved.
    pub async fn join(&mut self) -> Result<StageOutput, StageError> {
        flatten((&mut self.task).await)
    }

    pub async fn finish(mut self) -> Result<StageOutput, StageError> {
        self.join().await
    }

    /// Waits up to `grace` for the stage, then aborts its task.
    ///
    /// Processes spawned with `kill_on_drop` die with the task.
    pub async fn finish_within(mut self, grace: Duration) -> Result<StageOutput, StageError> {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!(
                    "{} stage did not stop within {:?}, aborting it",
                    self.kind, grace
                );
                self.task.abort();
                Err(StageError::Cancelled)
            }
        }
    }
}

fn flatten(
    joined: Result<Result<StageOutput, StageError>, JoinError>,
) -> Result<StageOutput, StageError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(StageError::Cancelled),
        Err(e) => Err(StageError::fatal(format!("stage task failed: {}", e))),
    }
}
