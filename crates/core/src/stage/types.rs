//! Types shared by the stage runners.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One of the four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Download,
    Patch,
    Transfer,
    Register,
}

impl StageKind {
    /// All stages in the order the pipeline runs them.
    pub const ORDER: [StageKind; 4] = [
        StageKind::Download,
        StageKind::Patch,
        StageKind::Transfer,
        StageKind::Register,
    ];

    /// Lowercase name, used for metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Patch => "patch",
            Self::Transfer => "transfer",
            Self::Register => "register",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Download => "Download",
            Self::Patch => "Patch",
            Self::Transfer => "Transfer",
            Self::Register => "Register",
        };
        f.write_str(label)
    }
}

/// Latest progress of a running stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second, if known.
    pub rate: Option<f64>,
    pub message: String,
}

impl StageProgress {
    /// Fraction complete in `0.0..=1.0`; zero when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_done as f64 / self.bytes_total as f64).min(1.0)
        }
    }
}

/// What the patch stage did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PatchOutcome {
    /// The executable was unpacked and swapped in place.
    Patched { executable: PathBuf },
    /// The tool found nothing to remove.
    NotNeeded { executable: PathBuf },
    /// No candidate executable was found.
    Skipped { reason: String },
    /// The tool failed; the install continues unpatched.
    Failed {
        executable: Option<PathBuf>,
        warning: String,
    },
}

/// Typed result of a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    Downloaded { items: usize, bytes: u64 },
    Patched { outcome: PatchOutcome },
    Transferred {
        files: u64,
        bytes: u64,
        destination: String,
    },
    Registered { already_registered: bool },
}

impl StageOutput {
    /// A warning the run should carry to its terminal record.
    pub fn warning(&self) -> Option<String> {
        match self {
            Self::Patched {
                outcome: PatchOutcome::Failed { warning, .. },
            } => Some(format!("patching failed: {}", warning)),
            _ => None,
        }
    }

    /// Short human-readable summary.
    pub fn summary(&self) -> String {
        match self {
            Self::Downloaded { items, bytes } => {
                format!("downloaded {} depot(s), {} bytes", items, bytes)
            }
            Self::Patched { outcome } => match outcome {
                PatchOutcome::Patched { executable } => {
                    format!("patched {}", executable.display())
                }
                PatchOutcome::NotNeeded { executable } => {
                    format!("{} needs no patching", executable.display())
                }
                PatchOutcome::Skipped { reason } => format!("patch skipped: {}", reason),
                PatchOutcome::Failed { warning, .. } => format!("patch failed: {}", warning),
            },
            Self::Transferred {
                files, destination, ..
            } => format!("transferred {} file(s) to {}", files, destination),
            Self::Registered { already_registered } => {
                if *already_registered {
                    "already registered".to_string()
                } else {
                    "registered".to_string()
                }
            }
        }
    }
}
