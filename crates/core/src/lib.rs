pub mod config;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod registrar;
pub mod remote;
pub mod stage;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use job::{InstallJob, JobError, JobId, JobSpec, Topology};
pub use orchestrator::{InstallOrchestrator, JobStatus, OrchestratorError, OrchestratorStatus};
pub use pipeline::{RunStage, TerminalOutcome};
pub use progress::{composite_percent, ProgressBus, ProgressSnapshot};
