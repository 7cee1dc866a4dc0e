//! Limits how often progress for one job reaches the bus.

use std::time::{Duration, Instant};

use super::types::ProgressSnapshot;
use crate::pipeline::RunStage;

/// Byte progress smaller than this fraction of the total is not worth an event.
const MIN_DELTA: f64 = 0.01;

#[derive(Debug, Clone)]
struct Emitted {
    at: Instant,
    stage: RunStage,
    bytes_done: u64,
    message: String,
}

/// Decides which snapshots of one job are published.
///
/// Stage changes and terminal records always pass. Other snapshots pass
/// when at least `min_interval` has elapsed since the last one and either
/// bytes moved by 1% of the total or the message changed.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last: Option<Emitted>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Returns whether to publish `snapshot`, remembering it if so.
    pub fn admit(&mut self, snapshot: &ProgressSnapshot, now: Instant) -> bool {
        let admit = match &self.last {
            None => true,
            Some(last) if last.stage != snapshot.stage || snapshot.is_terminal() => true,
            Some(last) if now.saturating_duration_since(last.at) < self.min_interval => false,
            Some(last) => {
                let delta = snapshot.bytes_done.saturating_sub(last.bytes_done);
                let moved = snapshot.bytes_total > 0
                    && delta as f64 >= snapshot.bytes_total as f64 * MIN_DELTA;
                moved || last.message != snapshot.message
            }
        };

        if admit {
            self.last = Some(Emitted {
                at: now,
                stage: snapshot.stage,
                bytes_done: snapshot.bytes_done,
                message: snapshot.message.clone(),
            });
        }
        admit
    }
}
