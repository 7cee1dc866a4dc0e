//! Error types for the remote channel.

use thiserror::Error;

/// Errors from talking to a remote endpoint.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// A local helper binary (rsync, ssh, sshpass) is missing.
    #[error("{tool} not found: {detail}")]
    ToolNotFound { tool: String, detail: String },

    /// The remote command or sync ran and failed.
    #[error("{message}")]
    CommandFailed {
        message: String,
        exit_code: Option<i32>,
        transient: bool,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote operation cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn command_failed(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::CommandFailed {
            message: message.into(),
            exit_code,
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::CommandFailed {
            message: message.into(),
            exit_code,
            transient: true,
        }
    }

    /// Whether the operation may succeed if simply tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandFailed { transient: true, .. })
    }
}
