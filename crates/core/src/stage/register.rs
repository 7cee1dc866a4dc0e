//! Register stage: hands the installed app to the registrar.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::config::RetryConfig;
use super::error::StageError;
use super::retry::with_retry;
use super::traits::{StageContext, StageRunner};
use super::types::{StageKind, StageOutput};
use crate::job::InstallJob;
use crate::registrar::{Registrar, RegistrationStatus};

pub struct RegisterStage {
    registrar: Arc<dyn Registrar>,
    retry: RetryConfig,
}

impl RegisterStage {
    pub fn new(registrar: Arc<dyn Registrar>, retry: RetryConfig) -> Self {
        Self { registrar, retry }
    }
}

#[async_trait]
impl StageRunner for RegisterStage {
    fn kind(&self) -> StageKind {
        StageKind::Register
    }

    async fn validate(&self, _job: &InstallJob) -> Result<(), StageError> {
        Ok(())
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        for artifact in self.registrar.planned_artifacts(&ctx.job) {
            ctx.ledger.record(artifact).await?;
        }
        ctx.progress.set_total(1);
        ctx.progress
            .set_message(format!("Registering with {}", self.registrar.name()));

        let job = ctx.job.as_ref();
        let cancel = &ctx.cancel;
        let registrar = self.registrar.as_ref();
        let status = with_retry(&self.retry, StageKind::Register, cancel, |_| async move {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            registrar.register(job).await.map_err(StageError::from)
        })
        .await?;

        ctx.progress.advance(1);
        let already_registered = status == RegistrationStatus::AlreadyRegistered;
        if already_registered {
            info!("App {} was already registered", ctx.job.app_id);
        }
        Ok(StageOutput::Registered { already_registered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PathLedger;
    use crate::registrar::RegistrationError;
    use crate::remote::RemoteError;
    use crate::stage::ProgressReporter;
    use crate::testing::{fixtures, MockRegistrar};
    use tokio_util::sync::CancellationToken;

    fn context() -> StageContext {
        let job = Arc::new(fixtures::local_job("220", std::path::Path::new("/tmp/decklift-test")));
        let (progress, _rx) = ProgressReporter::channel();
        StageContext {
            ledger: PathLedger::new(&job),
            job,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_already_registered_is_success() {
        let registrar = Arc::new(MockRegistrar::new());
        registrar.set_status(RegistrationStatus::AlreadyRegistered).await;
        let stage = RegisterStage::new(registrar.clone(), RetryConfig::immediate(1));

        let output = stage.run(context()).await.unwrap();
        assert_eq!(output, StageOutput::Registered { already_registered: true });
        assert_eq!(registrar.calls().await, 1);
    }

    #[tokio::test]
    async fn test_artifacts_recorded_before_register() {
        let registrar = Arc::new(MockRegistrar::new());
        let ctx = context();
        let planned = registrar.planned_artifacts(&ctx.job);
        let stage = RegisterStage::new(registrar, RetryConfig::immediate(1));

        stage.run(ctx.clone()).await.unwrap();
        for artifact in planned {
            assert!(ctx.ledger.contains(&artifact).await);
        }
    }

    #[tokio::test]
    async fn test_transient_error_retried() {
        let registrar = Arc::new(MockRegistrar::new());
        registrar.push_error(RegistrationError::Remote(RemoteError::transient(
            "connection closed",
            Some(255),
        )))
        .await;
        let stage = RegisterStage::new(registrar.clone(), RetryConfig::immediate(3));

        stage.run(context()).await.unwrap();
        assert_eq!(registrar.calls().await, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_fails() {
        let registrar = Arc::new(MockRegistrar::new());
        registrar.push_error(RegistrationError::InvalidEncoding {
            path: "config.vdf".to_string(),
        })
        .await;
        let stage = RegisterStage::new(registrar.clone(), RetryConfig::immediate(3));

        let result = stage.run(context()).await;
        assert!(matches!(result, Err(StageError::Fatal { .. })));
        assert_eq!(registrar.calls().await, 1);
    }
}
