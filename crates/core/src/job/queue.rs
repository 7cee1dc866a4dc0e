//! FIFO of pending installs plus the single active-run slot.
//!
//! Both live in one struct so one lock guards the duplicate check and the
//! slot together.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

use super::error::JobError;
use super::types::{InstallJob, JobId};
use crate::pipeline::RunControl;

/// A job waiting in, or taken from, the queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: Arc<InstallJob>,
    pub control: RunControl,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }
}

/// What `cancel` did.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The job never started and was removed.
    Removed(QueuedJob),
    /// The job is running; its cancellation token was triggered.
    Signalled,
    NotFound,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    pending: VecDeque<QueuedJob>,
    active: Option<QueuedJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a job, rejecting a second job for an app already queued or running.
    pub fn enqueue(&mut self, job: InstallJob, control: RunControl) -> Result<JobId, JobError> {
        if let Some(existing) = self.find_by_app(&job.app_id) {
            return Err(JobError::Duplicate {
                app_id: job.app_id.clone(),
                existing: existing.id(),
            });
        }

        let id = job.id;
        self.pending.push_back(QueuedJob {
            job: Arc::new(job),
            control,
            enqueued_at: Utc::now(),
        });
        Ok(id)
    }

    /// Moves the oldest pending job into the active slot.
    ///
    /// Returns `None` while the slot is occupied or nothing is pending.
    pub fn dequeue_next(&mut self) -> Option<QueuedJob> {
        if self.active.is_some() {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.active = Some(next.clone());
        Some(next)
    }

    /// Frees the active slot if it holds `id`.
    pub fn finish_active(&mut self, id: JobId) -> Option<QueuedJob> {
        if self.active.as_ref().map(QueuedJob::id) == Some(id) {
            self.active.take()
        } else {
            None
        }
    }

    pub fn cancel(&mut self, id: JobId) -> CancelOutcome {
        if let Some(active) = self.active.as_ref().filter(|a| a.id() == id) {
            active.control.cancel();
            return CancelOutcome::Signalled;
        }

        match self.pending.iter().position(|q| q.id() == id) {
            Some(index) => match self.pending.remove(index) {
                Some(removed) => {
                    removed.control.cancel();
                    CancelOutcome::Removed(removed)
                }
                None => CancelOutcome::NotFound,
            },
            None => CancelOutcome::NotFound,
        }
    }

    /// Pending or active job with this id.
    pub fn get(&self, id: JobId) -> Option<&QueuedJob> {
        self.active
            .iter()
            .chain(self.pending.iter())
            .find(|q| q.id() == id)
    }

    pub fn active(&self) -> Option<&QueuedJob> {
        self.active.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueuedJob> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending or running.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    fn find_by_app(&self, app_id: &str) -> Option<&QueuedJob> {
        self.active
            .iter()
            .chain(self.pending.iter())
            .find(|q| q.job.app_id == app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn job(app_id: &str) -> InstallJob {
        fixtures::local_job(app_id, std::path::Path::new("/tmp/decklift-queue-test"))
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = JobQueue::new();
        let first = queue.enqueue(job("10"), RunControl::new()).unwrap();
        let second = queue.enqueue(job("20"), RunControl::new()).unwrap();

        assert_eq!(queue.dequeue_next().unwrap().id(), first);
        queue.finish_active(first);
        assert_eq!(queue.dequeue_next().unwrap().id(), second);
    }

    #[test]
    fn test_single_active_slot() {
        let mut queue = JobQueue::new();
        let first = queue.enqueue(job("10"), RunControl::new()).unwrap();
        queue.enqueue(job("20"), RunControl::new()).unwrap();

        assert!(queue.dequeue_next().is_some());
        assert!(queue.dequeue_next().is_none());
        assert_eq!(queue.pending_len(), 1);

        assert!(queue.finish_active(first).is_some());
        assert!(queue.dequeue_next().is_some());
    }

    #[test]
    fn test_duplicate_app_rejected_while_queued_or_active() {
        let mut queue = JobQueue::new();
        let first = queue.enqueue(job("10"), RunControl::new()).unwrap();

        let err = queue.enqueue(job("10"), RunControl::new()).unwrap_err();
        assert!(matches!(err, JobError::Duplicate { existing, .. } if existing == first));

        queue.dequeue_next();
        assert!(queue.enqueue(job("10"), RunControl::new()).is_err());

        queue.finish_active(first);
        assert!(queue.enqueue(job("10"), RunControl::new()).is_ok());
    }

    #[test]
    fn test_cancel_pending_removes_and_signals() {
        let mut queue = JobQueue::new();
        let control = RunControl::new();
        let id = queue.enqueue(job("10"), control.clone()).unwrap();

        match queue.cancel(id) {
            CancelOutcome::Removed(removed) => assert_eq!(removed.id(), id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(control.is_cancelled());
        assert!(queue.is_idle());
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn test_cancel_active_signals_only() {
        let mut queue = JobQueue::new();
        let control = RunControl::new();
        let id = queue.enqueue(job("10"), control.clone()).unwrap();
        queue.dequeue_next();

        assert!(matches!(queue.cancel(id), CancelOutcome::Signalled));
        assert!(control.is_cancelled());
        assert!(queue.active().is_some());
    }

    #[test]
    fn test_cancel_unknown() {
        let mut queue = JobQueue::new();
        assert!(matches!(queue.cancel(JobId::new()), CancelOutcome::NotFound));
    }
}
