//! Install jobs and the queue that holds them.

mod error;
mod queue;
mod types;

pub use error::JobError;
pub use queue::{CancelOutcome, JobQueue, QueuedJob};
pub use types::{
    folder_name, is_plain_id, sanitize_folder_name, DepotItem, InstallJob, InstallTarget, JobId,
    JobSpec, Topology,
};
