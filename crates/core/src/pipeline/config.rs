//! Configuration for the pipeline state machine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How often a running stage is polled for progress.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a stage gets to stop after cancellation before it is aborted.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,

    /// Minimum spacing of progress events for one job.
    #[serde(default = "default_emit_interval")]
    pub emit_interval_ms: u64,

    /// Capacity of the progress broadcast channel.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_poll_interval() -> u64 {
    200
}

fn default_cancel_grace() -> u64 {
    5
}

fn default_emit_interval() -> u64 {
    150
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            cancel_grace_secs: default_cancel_grace(),
            emit_interval_ms: default_emit_interval(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms)
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_cancel_grace(mut self, secs: u64) -> Self {
        self.cancel_grace_secs = secs;
        self
    }

    pub fn with_emit_interval(mut self, ms: u64) -> Self {
        self.emit_interval_ms = ms;
        self
    }
}
