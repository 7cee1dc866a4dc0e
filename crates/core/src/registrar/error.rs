//! Error types for registration.

use std::io;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("remote registration failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("failed to update {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not valid UTF-8")]
    InvalidEncoding { path: String },
}

impl RegistrationError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_retryable(),
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            Self::InvalidEncoding { .. } => false,
        }
    }
}
