//! Per-job control signals shared between callers and the running pipeline.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::progress::ProgressSnapshot;

/// Cancellation token, pause flag and latest snapshot for one job.
///
/// Cloning shares the same signals.
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    latest: Arc<watch::Sender<Option<ProgressSnapshot>>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(watch::Sender::new(false)),
            latest: Arc::new(watch::Sender::new(None)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Waits until the job is not paused.
    ///
    /// Returns `false` if the job was cancelled while waiting.
    pub async fn wait_while_paused(&self) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    pub fn set_latest(&self, snapshot: ProgressSnapshot) {
        self.latest.send_replace(Some(snapshot));
    }

    /// Most recent snapshot produced for this job, throttled or not.
    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.latest.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_not_paused() {
        let control = RunControl::new();
        assert!(control.wait_while_paused().await);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_resumed() {
        let control = RunControl::new();
        control.pause();

        let resumer = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            resumer.resume();
        });

        let resumed = tokio::time::timeout(Duration::from_secs(2), control.wait_while_paused())
            .await
            .unwrap();
        assert!(resumed);
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let control = RunControl::new();
        control.pause();

        let canceller = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let resumed = tokio::time::timeout(Duration::from_secs(2), control.wait_while_paused())
            .await
            .unwrap();
        assert!(!resumed);
    }
}
