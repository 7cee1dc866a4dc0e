//! The progress record broadcast for every job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{InstallJob, JobId, Topology};
use crate::pipeline::RunStage;
use crate::stage::StageKind;

/// Immutable progress record for one job.
///
/// Byte counters are per stage and reset when the stage changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub app_id: String,
    pub stage: RunStage,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second, if known.
    pub rate_estimate: Option<f64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageKind>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(job: &InstallJob, stage: RunStage, message: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            app_id: job.app_id.clone(),
            stage,
            bytes_done: 0,
            bytes_total: 0,
            rate_estimate: None,
            message: message.into(),
            failed_stage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Percent of the current stage, `0.0..=100.0`.
    pub fn stage_percent(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_done as f64 * 100.0 / self.bytes_total as f64).min(100.0)
        }
    }
}

/// One progress figure across the whole install, for display.
///
/// Remote installs give downloading the 0–50 band and transferring the
/// 50–100 band; local installs let downloading span 0–100. Terminal
/// failures have no meaningful figure.
pub fn composite_percent(snapshot: &ProgressSnapshot, topology: Topology) -> Option<f64> {
    let pct = snapshot.stage_percent();
    let value = match (topology, snapshot.stage) {
        (_, RunStage::Queued) => 0.0,
        (_, RunStage::Completed) => 100.0,
        (_, RunStage::Failed | RunStage::Cancelled) => return None,
        (Topology::Local, RunStage::Downloading) => pct,
        (Topology::Local, _) => 100.0,
        (Topology::Remote, RunStage::Downloading) => pct * 0.5,
        (Topology::Remote, RunStage::Patching) => 50.0,
        (Topology::Remote, RunStage::Transferring) => 50.0 + pct * 0.5,
        (Topology::Remote, RunStage::Registering) => 100.0,
    };
    Some(value)
}
