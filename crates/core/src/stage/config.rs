//! Configuration for the stage runners.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Retry configuration for transient stage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in seconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Maximum delay between retries in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Meant for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_secs: 0,
            max_delay_secs: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.initial_delay_secs as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay_secs as f64).max(0.0))
    }
}

/// Download tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Path or name of the depot download tool.
    #[serde(default = "default_download_tool")]
    pub tool_path: PathBuf,

    /// Concurrent chunk downloads the tool may use.
    #[serde(default = "default_max_downloads")]
    pub max_downloads: u32,

    /// Ask the tool to verify chunks after download.
    #[serde(default = "default_true")]
    pub validate: bool,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_download_tool() -> PathBuf {
    PathBuf::from("DepotDownloaderMod")
}

fn default_max_downloads() -> u32 {
    25
}

fn default_true() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            tool_path: default_download_tool(),
            max_downloads: default_max_downloads(),
            validate: true,
            retry: RetryConfig::default(),
        }
    }
}

impl DownloadConfig {
    pub fn with_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_path = path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Patch tool configuration. Patching is skipped unless `tool_path` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    #[serde(default)]
    pub tool_path: Option<PathBuf>,

    /// Program used to launch the tool, e.g. `wine` for a Windows binary.
    #[serde(default)]
    pub launcher: Option<PathBuf>,

    #[serde(default = "default_patch_timeout")]
    pub timeout_secs: u64,
}

fn default_patch_timeout() -> u64 {
    600
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            tool_path: None,
            launcher: None,
            timeout_secs: default_patch_timeout(),
        }
    }
}

impl PatchConfig {
    pub fn with_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_path = Some(path.into());
        self
    }

    pub fn with_launcher(mut self, path: impl Into<PathBuf>) -> Self {
        self.launcher = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Transfer configuration for both topologies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_rsync")]
    pub rsync_path: PathBuf,

    #[serde(default = "default_ssh")]
    pub ssh_path: PathBuf,

    #[serde(default = "default_sshpass")]
    pub sshpass_path: PathBuf,

    /// Chunk size for cross-device local copies.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_rsync() -> PathBuf {
    PathBuf::from("rsync")
}

fn default_ssh() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_sshpass() -> PathBuf {
    PathBuf::from("sshpass")
}

fn default_buffer_size() -> usize {
    1024 * 1024 // 1 MiB
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync_path: default_rsync(),
            ssh_path: default_ssh(),
            sshpass_path: default_sshpass(),
            buffer_size: default_buffer_size(),
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Files touched when registering an install with the host application.
///
/// Paths are on the target machine, so they are strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// YAML file listing owned apps under `AdditionalApps:`.
    #[serde(default)]
    pub ownership_file: Option<String>,

    /// VDF config holding depot decryption keys.
    #[serde(default)]
    pub key_store_file: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_secs: 2,
            max_delay_secs: 10,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_secs(10));
    }

    #[test]
    fn test_immediate_retry_has_no_delay() {
        let retry = RetryConfig::immediate(4);
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_defaults() {
        let download = DownloadConfig::default();
        assert_eq!(download.max_downloads, 25);
        assert!(download.validate);
        assert!(PatchConfig::default().tool_path.is_none());
        assert_eq!(TransferConfig::default().rsync_path, PathBuf::from("rsync"));
    }
}
