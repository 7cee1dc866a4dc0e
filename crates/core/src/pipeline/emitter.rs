//! Turns a run's state into throttled snapshots on the bus.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::control::RunControl;
use super::types::{RunStage, TerminalOutcome};
use crate::job::InstallJob;
use crate::progress::{ProgressBus, ProgressSnapshot, ProgressThrottle};
use crate::stage::StageProgress;

/// Publishes the snapshots of one run.
///
/// Stages only move forward, and `bytes_done` never goes back within a
/// stage. Every snapshot becomes the job's latest, whether or not the
/// throttle lets it reach the bus.
pub struct RunEmitter {
    job: Arc<InstallJob>,
    bus: ProgressBus,
    control: RunControl,
    throttle: ProgressThrottle,
    stage: RunStage,
    current: StageProgress,
}

impl RunEmitter {
    pub fn new(job: Arc<InstallJob>, bus: ProgressBus, control: RunControl, interval: Duration) -> Self {
        Self {
            job,
            bus,
            control,
            throttle: ProgressThrottle::new(interval),
            stage: RunStage::Queued,
            current: StageProgress::default(),
        }
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    /// Moves to `stage` and publishes it. Backward moves are ignored.
    pub fn enter(&mut self, stage: RunStage, message: impl Into<String>) -> bool {
        if !self.stage.can_advance_to(stage) {
            warn!(
                job_id = %self.job.id,
                "Refusing stage change {} -> {}",
                self.stage,
                stage
            );
            return false;
        }
        self.stage = stage;
        self.current = StageProgress {
            message: message.into(),
            ..StageProgress::default()
        };
        self.emit(true);
        true
    }

    /// Publishes stage progress if the throttle allows it.
    pub fn progress(&mut self, progress: &StageProgress) {
        if self.stage.is_terminal() {
            return;
        }
        let bytes_done = self.current.bytes_done.max(progress.bytes_done);
        self.current = StageProgress {
            bytes_done,
            bytes_total: progress.bytes_total.max(bytes_done),
            rate: progress.rate,
            message: if progress.message.is_empty() {
                self.current.message.clone()
            } else {
                progress.message.clone()
            },
        };
        self.emit(false);
    }

    /// Publishes a message in the current stage, bypassing the throttle.
    pub fn notice(&mut self, message: impl Into<String>) {
        if self.stage.is_terminal() {
            return;
        }
        self.current.message = message.into();
        self.emit(true);
    }

    /// Publishes the terminal record. Only the first call has an effect.
    pub fn finish(&mut self, outcome: &TerminalOutcome) {
        if let Some(snapshot) = self.terminal(outcome) {
            self.bus.publish(snapshot);
        }
    }

    /// Moves to the terminal stage and returns its record unpublished.
    ///
    /// The record becomes the job's latest. Returns `None` once the run is
    /// already terminal.
    pub fn terminal(&mut self, outcome: &TerminalOutcome) -> Option<ProgressSnapshot> {
        let stage = outcome.run_stage();
        if !self.stage.can_advance_to(stage) {
            return None;
        }
        self.stage = stage;
        let mut snapshot = self.snapshot();
        snapshot.message = outcome.message();
        snapshot.failed_stage = outcome.failed_stage();
        snapshot.rate_estimate = None;
        self.control.set_latest(snapshot.clone());
        Some(snapshot)
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot::new(&self.job, self.stage, self.current.message.clone());
        snapshot.bytes_done = self.current.bytes_done;
        snapshot.bytes_total = self.current.bytes_total;
        snapshot.rate_estimate = self.current.rate;
        snapshot
    }

    fn emit(&mut self, force: bool) {
        let snapshot = self.snapshot();
        self.publish(snapshot, force);
    }

    fn publish(&mut self, snapshot: ProgressSnapshot, force: bool) {
        let admitted = self.throttle.admit(&snapshot, Instant::now());
        self.control.set_latest(snapshot.clone());
        if admitted || force {
            self.bus.publish(snapshot);
        }
    }
}
