//! Broadcast of progress snapshots to any number of readers.

use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::ProgressSnapshot;
use crate::job::JobId;
use crate::pipeline::RunStage;

/// Single-writer, multi-reader progress channel.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressSnapshot>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, snapshot: ProgressSnapshot) {
        // No receivers is fine.
        let _ = self.sender.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Logs stage changes and terminal records from the bus until it closes.
pub fn spawn_progress_logger(bus: &ProgressBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut stages: HashMap<JobId, RunStage> = HashMap::new();
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    let changed = stages.insert(snapshot.job_id, snapshot.stage) != Some(snapshot.stage);
                    if snapshot.is_terminal() {
                        stages.remove(&snapshot.job_id);
                        info!(
                            job_id = %snapshot.job_id,
                            app_id = %snapshot.app_id,
                            stage = %snapshot.stage,
                            "{}",
                            snapshot.message
                        );
                    } else if changed {
                        info!(
                            job_id = %snapshot.job_id,
                            app_id = %snapshot.app_id,
                            stage = %snapshot.stage,
                            "{}",
                            snapshot.message
                        );
                    } else {
                        debug!(
                            job_id = %snapshot.job_id,
                            bytes_done = snapshot.bytes_done,
                            bytes_total = snapshot.bytes_total,
                            "{}",
                            snapshot.message
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Progress logger lagged, skipped {} snapshots", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let bus = ProgressBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let job = fixtures::local_job("220", std::path::Path::new("/tmp/decklift"));
        bus.publish(ProgressSnapshot::new(&job, RunStage::Queued, "Queued"));

        assert_eq!(a.recv().await.unwrap().stage, RunStage::Queued);
        assert_eq!(b.recv().await.unwrap().job_id, job.id);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = ProgressBus::default();
        let job = fixtures::local_job("220", std::path::Path::new("/tmp/decklift"));
        bus.publish(ProgressSnapshot::new(&job, RunStage::Queued, "Queued"));
        assert_eq!(bus.receiver_count(), 0);
    }
}
