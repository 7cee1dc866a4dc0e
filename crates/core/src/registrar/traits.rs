//! Registrar trait definition.

use async_trait::async_trait;

use super::error::RegistrationError;
use super::types::RegistrationStatus;
use crate::job::InstallJob;
use crate::pipeline::TrackedPath;

/// Makes an installed app known to the host launcher.
///
/// Registration must be idempotent: registering the same job twice leaves
/// the launcher files as after the first call.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Registrar name for logging.
    fn name(&self) -> &str;

    /// Files `register` may create that cleanup should remove again.
    ///
    /// Shared files that are only edited (ownership list, key store) are
    /// not included.
    fn planned_artifacts(&self, job: &InstallJob) -> Vec<TrackedPath>;

    async fn register(&self, job: &InstallJob) -> Result<RegistrationStatus, RegistrationError>;
}
