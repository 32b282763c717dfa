use std::time::Duration;

use thiserror::Error;

/// Failures of a single backend call. Fatal to the call, never to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend produced no output")]
    EmptyOutput,

    #[error("Backend timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("Backend exited with {}: {stderr}", exit_code_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Failed to spawn backend process: {0}")]
    ProcessSpawnFailure(String),

    #[error("Backend I/O error: {0}")]
    Io(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (killed by signal)".to_string(),
    }
}

impl BackendError {
    pub fn non_zero_exit(code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::NonZeroExit {
            code,
            stderr: stderr.into(),
        }
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::ProcessSpawnFailure(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The user interrupted the turn. Not a failure: the in-flight run is discarded.
    #[error("Cancelled by user")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn as_backend(&self) -> Option<&BackendError> {
        match self {
            Error::Backend(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackendError::non_zero_exit(Some(3), "model not found");
        assert!(err.to_string().contains("status 3"));
        assert!(err.to_string().contains("model not found"));

        let err = BackendError::non_zero_exit(None, "");
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_timeout_display() {
        let err = BackendError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Backend timed out after 1.5s");
    }

    #[test]
    fn test_backend_error_converts() {
        let err: Error = BackendError::EmptyOutput.into();
        assert_eq!(err.as_backend(), Some(&BackendError::EmptyOutput));
        assert!(!err.is_cancelled());
        assert!(Error::Cancelled.is_cancelled());
    }
}
