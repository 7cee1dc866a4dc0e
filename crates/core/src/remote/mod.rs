//! Remote file-sync channel.
//!
//! The pipeline reaches a second machine only through [`RemoteChannel`].
//! [`RsyncChannel`] is the production implementation, built on the local
//! `rsync` and `ssh` binaries.

mod error;
mod rsync;
mod traits;
mod types;

pub use error::RemoteError;
pub use rsync::{rsync_exit_message, RsyncChannel};
pub use traits::RemoteChannel;
pub use types::{
    remote_join, remote_parent, shell_quote, Credentials, PushEvent, PushSummary, RemoteEndpoint,
    Secret,
};
