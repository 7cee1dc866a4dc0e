//! Patch stage: strips DRM wrappers from the main executable.
//!
//! Failures here never fail the install. They surface as
//! [`PatchOutcome::Failed`] and end up as a warning on the terminal record.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::config::PatchConfig;
use super::error::StageError;
use super::traits::{StageContext, StageRunner};
use super::types::{PatchOutcome, StageKind, StageOutput};
use crate::job::InstallJob;
use crate::metrics;
use crate::process::{resolve_tool, run_streaming, ProcessError, ProcessLimits};

/// How deep below the staging directory executables are searched for.
const SEARCH_DEPTH: usize = 3;

/// Installer and redistributable names that are never the game binary.
const IGNORED_NAMES: &[&str] = &["unins", "setup", "redist", "vcredist", "dxsetup"];

/// Exit code the tool uses for "no DRM found".
const EXIT_NOT_PACKED: i32 = 1;

/// An executable that could be patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub name_score: u8,
}

pub struct PatchStage {
    config: PatchConfig,
    grace: Duration,
}

impl PatchStage {
    pub fn new(config: PatchConfig) -> Self {
        Self {
            config,
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn build_command(&self, tool: &Path, exe: &Path) -> Command {
        let mut cmd = match &self.config.launcher {
            Some(launcher) => {
                let mut cmd = Command::new(launcher);
                cmd.arg(tool);
                cmd
            }
            None => Command::new(tool),
        };
        cmd.arg("-f")
            .arg(exe)
            .arg("--quiet")
            .arg("--realign")
            .arg("--recalcchecksum");
        if let Some(dir) = exe.parent() {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn patch(&self, ctx: &StageContext, tool: &Path, exe: &Path) -> Result<PatchOutcome, StageError> {
        ctx.progress.set_message(format!("Patching {}", file_name(exe)));
        let limits = ProcessLimits::new(self.grace)
            .with_timeout(Duration::from_secs(self.config.timeout_secs));

        let outcome = match run_streaming(self.build_command(tool, exe), &ctx.cancel, limits, |_| {})
            .await
        {
            Ok(outcome) => outcome,
            Err(ProcessError::Cancelled) => return Err(StageError::Cancelled),
            Err(e) => return Ok(failed(exe, e.to_string())),
        };

        match outcome.code() {
            Some(0) => {}
            Some(EXIT_NOT_PACKED) => {
                return Ok(PatchOutcome::NotNeeded {
                    executable: exe.to_path_buf(),
                })
            }
            code => {
                let detail = outcome.tail.last().cloned().unwrap_or_default();
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                return Ok(failed(exe, format!("exit {}: {}", code, detail)));
            }
        }

        let unpacked = unpacked_path(exe);
        if !fs::try_exists(&unpacked).await.unwrap_or(false) {
            return Ok(PatchOutcome::NotNeeded {
                executable: exe.to_path_buf(),
            });
        }

        let backup = backup_path(exe);
        ctx.ledger.record_local(&backup).await?;
        if let Err(e) = swap_in_unpacked(exe, &unpacked, &backup).await {
            return Ok(failed(exe, format!("could not replace executable: {}", e)));
        }

        info!("Patched {}", exe.display());
        Ok(PatchOutcome::Patched {
            executable: exe.to_path_buf(),
        })
    }
}

#[async_trait]
impl StageRunner for PatchStage {
    fn kind(&self) -> StageKind {
        StageKind::Patch
    }

    fn applies_to(&self, job: &InstallJob) -> bool {
        job.patch && self.config.tool_path.is_some()
    }

    async fn validate(&self, job: &InstallJob) -> Result<(), StageError> {
        let Some(tool) = &self.config.tool_path else {
            return Ok(());
        };
        if !job.patch {
            return Ok(());
        }
        match &self.config.launcher {
            // A launched tool is usually a foreign binary; only its file must exist.
            Some(launcher) => {
                if resolve_tool(launcher).is_none() {
                    return Err(StageError::configuration(format!(
                        "patch launcher not found: {}",
                        launcher.display()
                    )));
                }
                if !tool.is_file() {
                    return Err(StageError::configuration(format!(
                        "patch tool not found: {}",
                        tool.display()
                    )));
                }
            }
            None => {
                if resolve_tool(tool).is_none() {
                    return Err(StageError::configuration(format!(
                        "patch tool not found: {}",
                        tool.display()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        let Some(tool) = self.config.tool_path.clone() else {
            return Ok(StageOutput::Patched {
                outcome: PatchOutcome::Skipped {
                    reason: "no patch tool configured".to_string(),
                },
            });
        };

        let staging = ctx.job.staging_dir.clone();
        let display_name = ctx.job.display_name.clone();
        let candidates = tokio::task::spawn_blocking(move || find_candidates(&staging, &display_name))
            .await
            .map_err(|e| StageError::fatal(format!("candidate search failed: {}", e)))?;

        let Some(best) = candidates.first() else {
            return Ok(StageOutput::Patched {
                outcome: PatchOutcome::Skipped {
                    reason: "no executable found".to_string(),
                },
            });
        };

        ctx.progress.set_total(1);
        let outcome = self.patch(&ctx, &tool, &best.path).await?;
        ctx.progress.advance(1);

        if let PatchOutcome::Failed { warning, .. } = &outcome {
            warn!("Patching {} failed: {}", best.path.display(), warning);
            metrics::PATCH_WARNINGS.inc();
        }
        Ok(StageOutput::Patched { outcome })
    }
}

/// Executables under `root`, best candidate first.
///
/// Larger files rank higher; equal sizes are ordered by how well the file
/// name matches `display_name`.
pub fn find_candidates(root: &Path, display_name: &str) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = WalkDir::new(root)
        .max_depth(SEARCH_DEPTH)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if !name.ends_with(".exe") || name.ends_with(".original.exe") {
                return None;
            }
            if IGNORED_NAMES.iter().any(|ignored| name.contains(ignored)) {
                return None;
            }
            let size = entry.metadata().ok()?.len();
            let stem = name.trim_end_matches(".exe");
            Some(Candidate {
                path: entry.into_path(),
                size,
                name_score: name_score(stem, display_name),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then(b.name_score.cmp(&a.name_score))
            .then(a.path.cmp(&b.path))
    });
    candidates
}

/// 3 for an exact match, 2 for containment, 1 for a shared word, else 0.
fn name_score(stem: &str, display_name: &str) -> u8 {
    let stem = normalize(stem);
    let name = normalize(display_name);
    if stem.is_empty() || name.is_empty() {
        return 0;
    }
    if stem == name {
        return 3;
    }
    let compact_stem: String = stem.split_whitespace().collect();
    let compact_name: String = name.split_whitespace().collect();
    if compact_name.contains(&compact_stem) || compact_stem.contains(&compact_name) {
        return 2;
    }
    let shared = stem
        .split_whitespace()
        .any(|word| word.len() > 2 && name.split_whitespace().any(|w| w == word));
    u8::from(shared)
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `game.exe` -> `game.exe.unpacked.exe`
fn unpacked_path(exe: &Path) -> PathBuf {
    let mut name = exe.as_os_str().to_owned();
    name.push(".unpacked.exe");
    PathBuf::from(name)
}

/// `game.exe` -> `game.original.exe`
fn backup_path(exe: &Path) -> PathBuf {
    let stem = exe
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    exe.with_file_name(format!("{}.original.exe", stem))
}

async fn swap_in_unpacked(exe: &Path, unpacked: &Path, backup: &Path) -> std::io::Result<()> {
    fs::rename(exe, backup).await?;
    if let Err(e) = fs::rename(unpacked, exe).await {
        // Put the original back so the install still has a binary.
        let _ = fs::rename(backup, exe).await;
        return Err(e);
    }
    Ok(())
}

fn failed(exe: &Path, warning: String) -> PatchOutcome {
    PatchOutcome::Failed {
        executable: Some(exe.to_path_buf()),
        warning,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, size: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; size]).unwrap();
    }

    #[test]
    fn test_candidates_skip_installers_and_backups() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("Portal.exe"), 100);
        write(&root.join("unins000.exe"), 5_000);
        write(&root.join("_CommonRedist/vcredist_x64.exe"), 5_000);
        write(&root.join("Portal.original.exe"), 9_000);
        write(&root.join("readme.txt"), 9_000);

        let candidates = find_candidates(root, "Portal");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].path.ends_with("Portal.exe"));
    }

    #[test]
    fn test_largest_wins_and_name_breaks_ties() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("launcher.exe"), 100);
        write(&root.join("bin/HalfLife.exe"), 100);
        write(&root.join("bin/crashreporter.exe"), 50);

        let candidates = find_candidates(root, "Half-Life");
        assert!(candidates[0].path.ends_with("bin/HalfLife.exe"));

        write(&root.join("bin/engine.exe"), 400);
        let candidates = find_candidates(root, "Half-Life");
        assert!(candidates[0].path.ends_with("bin/engine.exe"));
    }

    #[test]
    fn test_search_depth_limit() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("a/b/c/deep.exe"), 10);
        assert!(find_candidates(temp.path(), "Deep").is_empty());
    }

    #[test]
    fn test_name_score() {
        assert_eq!(name_score("portal2", "Portal 2"), 2);
        assert_eq!(name_score("portal 2", "Portal 2"), 3);
        assert_eq!(name_score("hl2", "Half-Life 2"), 0);
        assert_eq!(name_score("dark souls launcher", "Dark Souls III"), 1);
    }

    #[test]
    fn test_paths() {
        let exe = Path::new("/g/Game.exe");
        assert_eq!(unpacked_path(exe), PathBuf::from("/g/Game.exe.unpacked.exe"));
        assert_eq!(backup_path(exe), PathBuf::from("/g/Game.original.exe"));
    }

    #[test]
    fn test_applies_only_with_tool_and_flag() {
        let job = crate::testing::fixtures::local_job("220", Path::new("/tmp/x"));
        assert!(!PatchStage::new(PatchConfig::default()).applies_to(&job));

        let stage = PatchStage::new(PatchConfig::default().with_tool("/opt/patch"));
        assert!(stage.applies_to(&job));

        let mut unpatched = job.clone();
        unpatched.patch = false;
        assert!(!stage.applies_to(&unpatched));
    }
}
