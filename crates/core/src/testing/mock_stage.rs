//! Mock stage runner for testing the pipeline.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::job::InstallJob;
use crate::pipeline::TrackedPath;
use crate::stage::{PatchOutcome, StageContext, StageError, StageKind, StageOutput, StageRunner};

/// What the mock does once it is running.
#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    Fail(StageError),
    /// Reports progress, then waits for cancellation.
    Hang { bytes_done: u64, bytes_total: u64 },
    /// Never returns, even when cancelled.
    IgnoreCancel,
}

/// Mock implementation of the StageRunner trait.
///
/// Clones share their run counter, so a test can keep one clone and hand
/// the other to the state machine.
///
/// # Example
///
/// ```rust,ignore
/// use decklift_core::testing::MockStage;
///
/// let download = MockStage::new(StageKind::Download)
///     .creating(vec![TrackedPath::Local(staging.clone())])
///     .hanging(30, 100);
///
/// // ... run the pipeline and cancel it ...
/// assert_eq!(download.runs(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MockStage {
    kind: StageKind,
    applies: bool,
    validation_error: Option<StageError>,
    creates: Vec<TrackedPath>,
    output: Option<StageOutput>,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
}

impl MockStage {
    /// A stage that succeeds with a default output for its kind.
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            applies: true,
            validation_error: None,
            creates: Vec::new(),
            output: None,
            behavior: Behavior::Succeed,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the stage not apply to any job.
    pub fn skipped(mut self) -> Self {
        self.applies = false;
        self
    }

    pub fn with_validation_error(mut self, error: StageError) -> Self {
        self.validation_error = Some(error);
        self
    }

    /// Records these paths in the ledger and creates the local ones.
    ///
    /// Paths with an extension become files, others directories.
    pub fn creating(mut self, paths: Vec<TrackedPath>) -> Self {
        self.creates = paths;
        self
    }

    pub fn failing(mut self, error: StageError) -> Self {
        self.behavior = Behavior::Fail(error);
        self
    }

    pub fn with_output(mut self, output: StageOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn hanging(mut self, bytes_done: u64, bytes_total: u64) -> Self {
        self.behavior = Behavior::Hang {
            bytes_done,
            bytes_total,
        };
        self
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.behavior = Behavior::IgnoreCancel;
        self
    }

    /// Number of times `run` was entered.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn default_output(&self, job: &InstallJob) -> StageOutput {
        match self.kind {
            StageKind::Download => StageOutput::Downloaded {
                items: job.depot_items.len(),
                bytes: job.declared_bytes(),
            },
            StageKind::Patch => StageOutput::Patched {
                outcome: PatchOutcome::Skipped {
                    reason: "mock".to_string(),
                },
            },
            StageKind::Transfer => StageOutput::Transferred {
                files: 0,
                bytes: 0,
                destination: job.target.display(),
            },
            StageKind::Register => StageOutput::Registered {
                already_registered: false,
            },
        }
    }

    async fn create(path: &TrackedPath) -> Result<(), StageError> {
        let TrackedPath::Local(path) = path else {
            return Ok(());
        };
        if path.extension().is_some() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, b"mock").await?;
        } else {
            tokio::fs::create_dir_all(path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StageRunner for MockStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn applies_to(&self, _job: &InstallJob) -> bool {
        self.applies
    }

    async fn validate(&self, _job: &InstallJob) -> Result<(), StageError> {
        match &self.validation_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        for path in &self.creates {
            ctx.ledger.record(path.clone()).await?;
            Self::create(path).await?;
        }

        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::Fail(error) => return Err(error.clone()),
            Behavior::Hang {
                bytes_done,
                bytes_total,
            } => {
                ctx.progress.set_total(*bytes_total);
                ctx.progress.advance(*bytes_done);
                ctx.cancel.cancelled().await;
                return Err(StageError::Cancelled);
            }
            Behavior::IgnoreCancel => return std::future::pending().await,
        }

        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        Ok(self
            .output
            .clone()
            .unwrap_or_else(|| self.default_output(&ctx.job)))
    }
}
