//! Error types for the trainloop runner.

use crate::callbacks::Hook;
use thiserror::Error;

/// Top-level error type for runner operations.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Invalid device/precision/stage declarations, or a component resolved out of order.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A checkpoint restore target is missing or fails verification.
    #[error("State not found: {0}")]
    StateNotFound(String),

    /// Saving or restoring durable state failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A callback hook returned an error.
    #[error("Callback '{callback}' failed in {hook}: {source}")]
    Callback {
        callback: String,
        hook: Hook,
        #[source]
        source: Box<RunnerError>,
    },

    /// A loader failed to produce the next batch.
    #[error("Data error: {0}")]
    Data(String),

    /// Shape or dtype mismatch inside a numeric collaborator.
    #[error("Tensor error: {0}")]
    Tensor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Coarse classification of a [`RunnerError`], following the unwrapped cause of
/// callback errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    StateNotFound,
    Persistence,
    Data,
    Tensor,
}

impl RunnerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn state_not_found(msg: impl Into<String>) -> Self {
        Self::StateNotFound(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn tensor(msg: impl Into<String>) -> Self {
        Self::Tensor(msg.into())
    }

    /// Wrap an error raised inside a callback hook.
    pub fn callback(callback: impl Into<String>, hook: Hook, source: RunnerError) -> Self {
        Self::Callback {
            callback: callback.into(),
            hook,
            source: Box::new(source),
        }
    }

    /// The category of the originating error.
    ///
    /// Callback errors report the kind of the error their hook raised; I/O and
    /// serialization failures are persistence failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::StateNotFound(_) => ErrorKind::StateNotFound,
            Self::Persistence(_) | Self::Io(_) | Self::Serde(_) => ErrorKind::Persistence,
            Self::Callback { source, .. } => source.kind(),
            Self::Data(_) => ErrorKind::Data,
            Self::Tensor(_) => ErrorKind::Tensor,
        }
    }

    /// Whether this error came out of a callback hook.
    pub fn is_callback_error(&self) -> bool {
        matches!(self, Self::Callback { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_error_reports_inner_kind() {
        let err = RunnerError::callback(
            "checkpoint",
            Hook::StageStart,
            RunnerError::state_not_found("best"),
        );
        assert!(err.is_callback_error());
        assert_eq!(err.kind(), ErrorKind::StateNotFound);
        assert_eq!(
            err.to_string(),
            "Callback 'checkpoint' failed in on_stage_start: State not found: best"
        );
    }

    #[test]
    fn test_io_errors_are_persistence() {
        let err: RunnerError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }
}
