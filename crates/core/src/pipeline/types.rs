//! Types for pipeline runs.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::cleanup::CleanupReport;
use crate::stage::StageKind;

/// Lifecycle stage of a run. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Queued,
    Downloading,
    Patching,
    Transferring,
    Registering,
    Completed,
    Failed,
    Cancelled,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Runs only move forward and never leave a terminal stage.
    pub fn can_advance_to(&self, next: RunStage) -> bool {
        !self.is_terminal() && next > *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Patching => "patching",
            Self::Transferring => "transferring",
            Self::Registering => "registering",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<StageKind> for RunStage {
    fn from(kind: StageKind) -> Self {
        match kind {
            StageKind::Download => Self::Downloading,
            StageKind::Patch => Self::Patching,
            StageKind::Transfer => Self::Transferring,
            StageKind::Register => Self::Registering,
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Success {
        message: String,
        warnings: Vec<String>,
    },
    Cancelled {
        message: String,
        cleanup: CleanupReport,
    },
    Failed {
        /// Stage that failed; `None` when the run never reached one.
        stage: Option<StageKind>,
        reason: String,
        cleanup: CleanupReport,
    },
}

impl TerminalOutcome {
    pub fn run_stage(&self) -> RunStage {
        match self {
            Self::Success { .. } => RunStage::Completed,
            Self::Cancelled { .. } => RunStage::Cancelled,
            Self::Failed { .. } => RunStage::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Self::Failed { stage, .. } => *stage,
            _ => None,
        }
    }

    pub fn cleanup(&self) -> Option<&CleanupReport> {
        match self {
            Self::Cancelled { cleanup, .. } | Self::Failed { cleanup, .. } => Some(cleanup),
            Self::Success { .. } => None,
        }
    }

    /// Human-readable summary for the terminal record.
    pub fn message(&self) -> String {
        match self {
            Self::Success { message, warnings } if warnings.is_empty() => message.clone(),
            Self::Success { message, warnings } => {
                format!("{} (warning: {})", message, warnings.join("; "))
            }
            Self::Cancelled { message, .. } => message.clone(),
            Self::Failed {
                stage: Some(stage),
                reason,
                ..
            } => format!("{} failed: {}", stage, reason),
            Self::Failed {
                stage: None,
                reason,
                ..
            } => format!("Install failed: {}", reason),
        }
    }
}
