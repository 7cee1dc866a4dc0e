//! The pipeline state machine and what it owns while a job runs.
//!
//! A run moves through [`RunStage`]s in order, records every location it
//! writes to in a [`PathLedger`], and ends in a [`TerminalOutcome`].
//! Cancelled and failed runs are cleaned up by the [`CleanupController`].

mod cleanup;
mod config;
mod control;
mod emitter;
mod ledger;
mod machine;
mod types;

pub use cleanup::{remove_local_path, CleanupController, CleanupReport};
pub use config::PipelineConfig;
pub use control::RunControl;
pub use emitter::RunEmitter;
pub use ledger::{discard_journal, load_journal, PathLedger, RunJournal, TrackedPath, JOURNAL_FILE};
pub use machine::PipelineStateMachine;
pub use types::{RunStage, TerminalOutcome};
