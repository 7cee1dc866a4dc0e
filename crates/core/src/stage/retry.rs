//! Bounded retry of transient stage failures.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::config::RetryConfig;
use super::error::StageError;
use super::types::StageKind;
use crate::metrics;

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
///
/// `op` receives the 1-based attempt number. A transient error on the last
/// attempt is returned as fatal.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    stage: StageKind,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    stage, attempt, max_attempts, e, delay
                );
                metrics::STAGE_RETRIES
                    .with_label_values(&[stage.as_str()])
                    .inc();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e.into_fatal()),
            Ok(value) => return Ok(value),
        }
    }
}
