//! Install orchestrator: the submission surface around the pipeline.
//!
//! Jobs are queued FIFO and run one at a time. Callers cancel, pause and
//! resume them by id and follow progress on the bus.

mod runner;
mod types;

pub use runner::{InstallOrchestrator, MAX_FINISHED_RUNS};
pub use types::{FinishedRun, JobPhase, JobStatus, OrchestratorError, OrchestratorStatus};
