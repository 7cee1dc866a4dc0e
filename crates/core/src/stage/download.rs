//! Download stage: fetches every depot item with the external depot tool.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use super::config::DownloadConfig;
use super::error::StageError;
use super::retry::with_retry;
use super::traits::{StageContext, StageRunner};
use super::types::{StageKind, StageOutput};
use crate::job::{DepotItem, InstallJob};
use crate::pipeline::remove_local_path;
use crate::process::{resolve_tool, run_streaming, ProcessLimits, ProcessOutcome};

/// Output fragments that mean a retry may succeed.
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection was closed",
    "temporarily unavailable",
    "service unavailable",
    "too many requests",
    "rate limit",
    "network is unreachable",
];

static PERCENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d{1,2})?)%").ok());

static SPEED: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d+\.?\d*)\s*(KB|MB|GB)/s").ok());

/// Runs the depot download tool once per item, in order.
pub struct DepotDownloadStage {
    config: DownloadConfig,
    grace: Duration,
}

impl DepotDownloadStage {
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            config,
            grace: Duration::from_secs(5),
        }
    }

    /// Time the tool gets to exit after cancellation.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Where the depot keys for a job are written, next to its staging dir.
    pub fn keys_file(job: &InstallJob) -> PathBuf {
        job.staging_dir.with_file_name(format!("install_{}.depotkeys", job.app_id))
    }

    fn build_command(&self, job: &InstallJob, item: &DepotItem, keys: &PathBuf) -> Command {
        let mut cmd = Command::new(&self.config.tool_path);
        cmd.arg("-app")
            .arg(&job.app_id)
            .arg("-depot")
            .arg(&item.depot_id)
            .arg("-manifest")
            .arg(&item.manifest_id)
            .arg("-manifestfile")
            .arg(&item.manifest_path)
            .arg("-depotkeys")
            .arg(keys)
            .arg("-max-downloads")
            .arg(self.config.max_downloads.to_string())
            .arg("-dir")
            .arg(&job.staging_dir);
        if self.config.validate {
            cmd.arg("-validate");
        }
        cmd
    }

    async fn prepare(&self, ctx: &StageContext, keys: &PathBuf) -> Result<(), StageError> {
        let job = &ctx.job;

        ctx.ledger.record_local(&job.staging_dir).await?;
        remove_local_path(&job.staging_dir).await?;
        fs::create_dir_all(&job.staging_dir).await?;

        ctx.ledger.record_local(keys).await?;
        let contents: String = job
            .depot_items
            .iter()
            .map(|item| format!("{};{}\n", item.depot_id, item.decryption_key))
            .collect();
        fs::write(keys, contents).await?;
        Ok(())
    }

    async fn fetch_item(
        &self,
        ctx: &StageContext,
        keys: &PathBuf,
        index: usize,
        base: u64,
    ) -> Result<(), StageError> {
        let job = &ctx.job;
        let item = &job.depot_items[index];
        let weight = item_weight(item);
        let count = job.depot_items.len();

        ctx.progress.set_message(format!(
            "Downloading depot {} ({}/{})",
            item.depot_id,
            index + 1,
            count
        ));

        with_retry(&self.config.retry, StageKind::Download, &ctx.cancel, |attempt| {
            let command = self.build_command(job, item, keys);
            let progress = ctx.progress.clone();
            async move {
                if attempt > 1 {
                    info!("Retrying depot {} (attempt {})", item.depot_id, attempt);
                }
                let outcome = run_streaming(
                    command,
                    &ctx.cancel,
                    ProcessLimits::new(self.grace),
                    |line| {
                        if let Some(pct) = parse_percent(line) {
                            let done = base + (weight as f64 * pct / 100.0) as u64;
                            progress.advance_with_rate(done, parse_speed(line));
                        }
                    },
                )
                .await?;

                if outcome.success() {
                    Ok(())
                } else {
                    Err(classify_failure(&item.depot_id, &outcome))
                }
            }
        })
        .await?;

        ctx.progress.advance(base + weight);
        Ok(())
    }
}

#[async_trait]
impl StageRunner for DepotDownloadStage {
    fn kind(&self) -> StageKind {
        StageKind::Download
    }

    async fn validate(&self, job: &InstallJob) -> Result<(), StageError> {
        if resolve_tool(&self.config.tool_path).is_none() {
            return Err(StageError::configuration(format!(
                "download tool not found: {}",
                self.config.tool_path.display()
            )));
        }
        for item in &job.depot_items {
            if !fs::try_exists(&item.manifest_path).await.unwrap_or(false) {
                return Err(StageError::configuration(format!(
                    "manifest for depot {} not found: {}",
                    item.depot_id,
                    item.manifest_path.display()
                )));
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        let job = &ctx.job;
        let keys = Self::keys_file(job);
        let total: u64 = job.depot_items.iter().map(item_weight).sum();
        ctx.progress.set_total(total);

        self.prepare(&ctx, &keys).await?;

        let mut result = Ok(());
        let mut base = 0;
        for (index, item) in job.depot_items.iter().enumerate() {
            if let Err(e) = self.fetch_item(&ctx, &keys, index, base).await {
                result = Err(e);
                break;
            }
            base += item_weight(item);
        }

        // Keys are secrets; never leave them behind.
        if let Err(e) = remove_local_path(&keys).await {
            warn!("Failed to remove depot keys {}: {}", keys.display(), e);
        }
        result?;

        info!(
            "Downloaded {} depot(s) for app {}",
            job.depot_items.len(),
            job.app_id
        );
        Ok(StageOutput::Downloaded {
            items: job.depot_items.len(),
            bytes: total,
        })
    }
}

/// Progress weight of an item; unknown sizes still count.
fn item_weight(item: &DepotItem) -> u64 {
    item.size_bytes.max(1)
}

/// Extracts the last percentage on a line of tool output.
pub fn parse_percent(line: &str) -> Option<f64> {
    PERCENT
        .as_ref()?
        .captures_iter(line)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|pct| (0.0..=100.0).contains(pct))
}

/// Extracts a rate like `12.5 MB/s` as bytes per second.
pub fn parse_speed(line: &str) -> Option<f64> {
    let caps = SPEED.as_ref()?.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2)?.as_str() {
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * multiplier)
}

fn classify_failure(depot_id: &str, outcome: &ProcessOutcome) -> StageError {
    let code = outcome
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let last = outcome.tail.last().cloned().unwrap_or_default();
    let message = format!("depot {} download failed (exit {}): {}", depot_id, code, last);

    let tail = outcome.tail_text().to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|marker| tail.contains(marker)) {
        StageError::transient(message)
    } else {
        StageError::fatal(message)
    }
}
