//! Remote channel trait definition.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::RemoteError;
use super::types::{PushEvent, PushSummary, RemoteEndpoint};

/// A durable channel to a second machine.
///
/// Implementations push directory trees and run small filesystem
/// operations on the remote side. Paths on the remote side are plain
/// strings since they need not be valid on the local machine.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Channel name for logging.
    fn name(&self) -> &str;

    /// Checks that the local helpers this channel needs are available.
    async fn validate(&self) -> Result<(), RemoteError>;

    /// Pushes the contents of `local_dir` into `remote_dir`.
    ///
    /// Events are sent best-effort; a full channel drops them.
    async fn push(
        &self,
        endpoint: &RemoteEndpoint,
        local_dir: &Path,
        remote_dir: &str,
        events: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<PushSummary, RemoteError>;

    async fn exists(&self, endpoint: &RemoteEndpoint, remote_path: &str) -> Result<bool, RemoteError>;

    async fn create_dir_all(&self, endpoint: &RemoteEndpoint, remote_path: &str)
        -> Result<(), RemoteError>;

    /// Recursively removes a path. Missing paths are not an error.
    async fn remove(&self, endpoint: &RemoteEndpoint, remote_path: &str) -> Result<(), RemoteError>;

    /// Reads a whole file, `None` if it does not exist.
    async fn read_file(
        &self,
        endpoint: &RemoteEndpoint,
        remote_path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn write_file(
        &self,
        endpoint: &RemoteEndpoint,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<(), RemoteError>;
}
