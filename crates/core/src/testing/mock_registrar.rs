//! Mock registrar for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::job::{InstallJob, JobId};
use crate::pipeline::TrackedPath;
use crate::registrar::{Registrar, RegistrationError, RegistrationStatus};

/// Mock implementation of the Registrar trait.
///
/// Queued errors are returned one per call before the configured status.
///
/// # Example
///
/// ```rust,ignore
/// use decklift_core::testing::MockRegistrar;
///
/// let registrar = MockRegistrar::new();
/// registrar.push_error(RegistrationError::Remote(RemoteError::transient("closed", Some(255)))).await;
///
/// // ... run the register stage ...
/// assert_eq!(registrar.calls().await, 2);
/// ```
#[derive(Debug, Clone)]
pub struct MockRegistrar {
    status: Arc<RwLock<RegistrationStatus>>,
    errors: Arc<RwLock<VecDeque<RegistrationError>>>,
    calls: Arc<RwLock<Vec<JobId>>>,
}

impl Default for MockRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRegistrar {
    pub fn new() -> Self {
        Self {
            status: Arc::new(RwLock::new(RegistrationStatus::Registered)),
            errors: Arc::new(RwLock::new(VecDeque::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Status returned once queued errors are used up.
    pub async fn set_status(&self, status: RegistrationStatus) {
        *self.status.write().await = status;
    }

    /// Queues an error for the next call.
    pub async fn push_error(&self, error: RegistrationError) {
        self.errors.write().await.push_back(error);
    }

    /// Number of `register` calls, failed ones included.
    pub async fn calls(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Jobs passed to `register`, in call order.
    pub async fn recorded_jobs(&self) -> Vec<JobId> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl Registrar for MockRegistrar {
    fn name(&self) -> &str {
        "mock"
    }

    fn planned_artifacts(&self, job: &InstallJob) -> Vec<TrackedPath> {
        vec![TrackedPath::Local(
            job.staging_dir
                .with_file_name(format!("appmanifest_{}.acf", job.app_id)),
        )]
    }

    async fn register(&self, job: &InstallJob) -> Result<RegistrationStatus, RegistrationError> {
        self.calls.write().await.push(job.id);
        if let Some(error) = self.errors.write().await.pop_front() {
            return Err(error);
        }
        Ok(*self.status.read().await)
    }
}
