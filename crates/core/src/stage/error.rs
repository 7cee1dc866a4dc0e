//! Error types for stage runners.

use thiserror::Error;

use crate::process::ProcessError;
use crate::registrar::RegistrationError;
use crate::remote::RemoteError;

/// Stage failure, classified by the runner that produced it.
///
/// The state machine only branches on the variant; messages are for humans.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// May succeed on retry. Runners retry these internally; one escaping a
    /// runner is treated as fatal.
    #[error("{message}")]
    Transient { message: String },

    /// Aborts the job.
    #[error("{message}")]
    Fatal { message: String },

    /// A tool or setting needed by the stage is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Reclassifies an exhausted transient error as fatal.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Transient { message } => Self::Fatal { message },
            other => other,
        }
    }

    /// Prefixes the message with some context.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::Transient { message } => Self::transient(format!("{}: {}", context, message)),
            Self::Fatal { message } => Self::fatal(format!("{}: {}", context, message)),
            Self::Configuration { message } => {
                Self::configuration(format!("{}: {}", context, message))
            }
            Self::Cancelled => Self::Cancelled,
        }
    }
}

impl From<ProcessError> for StageError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotFound { .. } => Self::configuration(err.to_string()),
            ProcessError::Cancelled => Self::Cancelled,
            other => Self::fatal(other.to_string()),
        }
    }
}

impl From<RemoteError> for StageError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::ToolNotFound { .. } => Self::configuration(err.to_string()),
            RemoteError::Cancelled => Self::Cancelled,
            ref e if e.is_retryable() => Self::transient(e.to_string()),
            other => Self::fatal(other.to_string()),
        }
    }
}

impl From<RegistrationError> for StageError {
    fn from(err: RegistrationError) -> Self {
        if err.is_retryable() {
            Self::transient(err.to_string())
        } else {
            Self::fatal(err.to_string())
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::fatal(format!("I/O error: {}", err))
    }
}
