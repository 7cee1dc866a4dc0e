//! Stage runners of the install pipeline.
//!
//! Each stage wraps one external collaborator behind [`StageRunner`]:
//!
//! - [`DepotDownloadStage`] drives the depot download tool.
//! - [`PatchStage`] strips DRM wrappers from the main executable.
//! - [`TransferStage`] moves the staged tree locally or over a [`RemoteChannel`].
//! - [`RegisterStage`] hands the result to a [`Registrar`].
//!
//! [`RemoteChannel`]: crate::remote::RemoteChannel
//! [`Registrar`]: crate::registrar::Registrar

mod config;
mod download;
mod error;
mod handle;
mod patch;
mod register;
mod retry;
mod traits;
mod transfer;
mod types;

pub use config::{DownloadConfig, PatchConfig, RegistrationConfig, RetryConfig, TransferConfig};
pub use download::{parse_percent, parse_speed, DepotDownloadStage};
pub use error::StageError;
pub use handle::{ProgressReporter, StageHandle};
pub use patch::{find_candidates, Candidate, PatchStage};
pub use register::RegisterStage;
pub use retry::with_retry;
pub use traits::{StageContext, StageRunner};
pub use transfer::TransferStage;
pub use types::{PatchOutcome, StageKind, StageOutput, StageProgress};
